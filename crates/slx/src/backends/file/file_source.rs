use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{trace, warn};

use crate::backends::Source;
use crate::common::{ChannelId, LogRecord};

// -- 📂 FileSourceConfig: "It's just a file", said no sysadmin ever before the disk filled up.
// KNOWLEDGE GRAPH: config lives co-located with the backend that uses it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FileSourceConfig {
    /// 🏷️ every record read from this file belongs to this channel
    pub channel: ChannelId,
    pub file_name: String,
    #[serde(default)]
    pub encoding: RecordEncoding,
}

/// 🔤 How one line becomes one payload.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordEncoding {
    /// 📝 the line IS the payload
    #[default]
    Plain,
    /// 🎁 the line is base64 of the payload (Firehose style, gzip welcome)
    Base64,
}

/// 📂 FileSource: reads a file line by line, one record per non-empty line.
///
/// A line that will not decode is skipped with a warning. One bad line does not get
/// to take the whole file down with it.
#[derive(Debug)]
pub(crate) struct FileSource {
    lines: Lines<BufReader<File>>,
    config: FileSourceConfig,
    line_number: u64,
}

impl FileSource {
    pub(crate) async fn new(config: FileSourceConfig) -> Result<Self> {
        let file_handle = File::open(&config.file_name).await.context(format!(
            "💀 The door to '{}' would not budge. We knocked. We checked permissions. \
             The file remains unopened. Channel '{}' will have nothing to say.",
            config.file_name, config.channel
        ))?;
        Ok(Self {
            lines: BufReader::new(file_handle).lines(),
            config,
            line_number: 0,
        })
    }

    fn decode(&self, line: &str) -> Option<Vec<u8>> {
        match self.config.encoding {
            RecordEncoding::Plain => Some(line.as_bytes().to_vec()),
            RecordEncoding::Base64 => match STANDARD.decode(line.trim()) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(
                        "🗑️ skipping line {} of '{}': not valid base64 ({e})",
                        self.line_number, self.config.file_name
                    );
                    None
                }
            },
        }
    }
}

#[async_trait]
impl Source for FileSource {
    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            let Some(line) = self.lines.next_line().await.context(format!(
                "💀 Reading '{}' failed after line {}. The disk has entered its villain arc.",
                self.config.file_name, self.line_number
            ))?
            else {
                trace!("🏁 '{}' exhausted after {} lines", self.config.file_name, self.line_number);
                return Ok(None);
            };
            self.line_number += 1;

            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some(payload) = self.decode(line) {
                return Ok(Some(LogRecord::arriving_now(
                    self.config.channel.clone(),
                    payload,
                )));
            }
        }
    }
}
