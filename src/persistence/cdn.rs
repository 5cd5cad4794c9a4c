//! Optional CDN pre-cache sink: downloads `original`/`thumbnail` media
//! through the outbound allowlist and republishes them to an S3-compatible
//! object store (spec.md §4.8).

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use uuid::Uuid;

use crate::net;

const MAX_DOWNLOAD_BYTES: u64 = 50 * 1024 * 1024;
const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct CdnSink {
    s3: S3Client,
    bucket: String,
    public_url_base: String,
    http: reqwest::Client,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Variant {
    Original,
    Thumbnail,
}

impl Variant {
    fn segment(self) -> &'static str {
        match self {
            Variant::Original => "original",
            Variant::Thumbnail => "thumbnail",
        }
    }
}

impl CdnSink {
    pub fn new(s3: S3Client, bucket: String, public_url_base: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client configuration is valid");
        Self { s3, bucket, public_url_base, http }
    }

    /// Downloads `source_url`, uploads it under `media/<item_id>/<variant>.<ext>`,
    /// and returns the public CDN URL. Any failure here is logged by the
    /// caller and never aborts the commit it's attached to.
    pub async fn precache(&self, item_id: Uuid, variant: Variant, source_url: &str) -> anyhow::Result<String> {
        net::validate_outbound_url(source_url, &[]).map_err(|e| anyhow::anyhow!("blocked source host: {e}"))?;

        let (bytes, content_type) = self.download(source_url).await?;
        let ext = extension_for(source_url, &content_type);
        let key = format!("media/{item_id}/{}.{ext}", variant.segment());

        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("failed to upload to object store: {e}"))?;

        Ok(format!("{}/{}", self.public_url_base.trim_end_matches('/'), key))
    }

    async fn download(&self, url: &str) -> anyhow::Result<(Vec<u8>, String)> {
        let mut current = url.to_string();
        for _ in 0..5 {
            net::validate_outbound_url(&current, &[]).map_err(|e| anyhow::anyhow!("blocked redirect host: {e}"))?;
            let response = self.http.get(&current).send().await?;

            if response.status().is_redirection() {
                if let Some(location) = response.headers().get(reqwest::header::LOCATION) {
                    let location = location.to_str()?.to_string();
                    current = url::Url::parse(&current)?.join(&location)?.to_string();
                    continue;
                }
            }

            if !response.status().is_success() {
                anyhow::bail!("unexpected status {} fetching {current}", response.status());
            }

            if let Some(len) = response.content_length() {
                if len > MAX_DOWNLOAD_BYTES {
                    anyhow::bail!("asset exceeds {MAX_DOWNLOAD_BYTES} byte cap ({len} bytes)");
                }
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let content_type = correct_content_type(&current, &content_type);

            let bytes = response.bytes().await?;
            if bytes.len() as u64 > MAX_DOWNLOAD_BYTES {
                anyhow::bail!("asset exceeds {MAX_DOWNLOAD_BYTES} byte cap ({} bytes)", bytes.len());
            }

            return Ok((bytes.to_vec(), content_type));
        }
        anyhow::bail!("too many redirect hops downloading {url}")
    }
}

/// A `.mp4`/`.webm` URL occasionally reports `image/*` from a misconfigured
/// origin; trust the extension over the header in that case.
fn correct_content_type(url: &str, content_type: &str) -> String {
    let lower = url.to_lowercase();
    if content_type.starts_with("image/") {
        if lower.ends_with(".mp4") {
            return "video/mp4".to_string();
        }
        if lower.ends_with(".webm") {
            return "video/webm".to_string();
        }
    }
    content_type.to_string()
}

fn extension_for(url: &str, content_type: &str) -> &'static str {
    let lower = url.to_lowercase();
    if lower.ends_with(".mp4") || content_type == "video/mp4" {
        "mp4"
    } else if lower.ends_with(".webm") || content_type == "video/webm" {
        "webm"
    } else if lower.ends_with(".gif") || content_type.contains("gif") {
        "gif"
    } else if lower.ends_with(".png") || content_type == "image/png" {
        "png"
    } else if lower.ends_with(".webp") || content_type == "image/webp" {
        "webp"
    } else {
        "jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrects_mp4_served_as_image() {
        assert_eq!(correct_content_type("https://cdn.example.com/a.mp4", "image/jpeg"), "video/mp4");
        assert_eq!(correct_content_type("https://cdn.example.com/a.jpg", "image/jpeg"), "image/jpeg");
    }

    #[test]
    fn picks_extension_from_url_or_content_type() {
        assert_eq!(extension_for("https://cdn.example.com/a.mp4", "video/mp4"), "mp4");
        assert_eq!(extension_for("https://cdn.example.com/a", "image/png"), "png");
        assert_eq!(extension_for("https://cdn.example.com/a", "application/octet-stream"), "jpg");
    }
}
