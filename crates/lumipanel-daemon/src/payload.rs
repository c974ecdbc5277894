//! HTTP payload source for display updates.
//!
//! The manager serves the GUI file over plain HTTP with byte-range
//! support; chunks are fetched lazily so the whole file never has to
//! fit in memory.

use lumipanel_link::{Error, PayloadSource, Result};
use reqwest::header::RANGE;
use tracing::debug;

pub struct HttpPayloadSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPayloadSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl PayloadSource for HttpPayloadSource {
    async fn total_size(&mut self) -> Result<u64> {
        let response = self
            .client
            .head(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Payload(e.to_string()))?;
        let size = response
            .content_length()
            .ok_or_else(|| Error::Payload("manager sent no Content-Length".into()))?;
        debug!("update payload at {} is {} bytes", self.url, size);
        Ok(size)
    }

    async fn fetch(&mut self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, range_header(offset, length))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Payload(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Payload(e.to_string()))?;
        if body.len() != length as usize {
            return Err(Error::ShortPayload {
                expected: length as usize,
                actual: body.len(),
            });
        }
        Ok(body.to_vec())
    }
}

/// Byte-range header value for `length` bytes starting at `offset`.
/// The range end is inclusive.
fn range_header(offset: u64, length: u32) -> String {
    format!("bytes={}-{}", offset, offset + u64::from(length) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_end_is_inclusive() {
        assert_eq!(range_header(0, 4096), "bytes=0-4095");
        assert_eq!(range_header(8192, 1808), "bytes=8192-9999");
        assert_eq!(range_header(5000, 1), "bytes=5000-5000");
    }
}
