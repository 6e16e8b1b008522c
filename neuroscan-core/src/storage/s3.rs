//! S3 scan store over the REST API.
//!
//! Requests are signed with [`super::sigv4`]. Listing uses `ListObjectsV2`
//! with continuation tokens; the XML is picked apart with plain string
//! search since only `Key`, `IsTruncated` and `NextContinuationToken` matter.
//!
//! Addressing is virtual-host (`<bucket>.s3[.<region>].amazonaws.com`) unless
//! `endpoint_url` is set, in which case requests go path-style to
//! `<endpoint>/<bucket>/<key>` (MinIO, LocalStack).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

use super::sigv4::{self, AwsCredentials, SignableRequest};
use super::{Artifact, KeyLayout, ScanStore, StoreError, StoredImage};
use crate::config::StorageConfig;
use crate::models::{content_type_for, ScanImage, ScanRecord, ScanTags};
use crate::timestamp::ScanTimestamp;

const META_TUMOR_TYPE: &str = "x-amz-meta-tumor-type";
const META_TUMOR_SIZE: &str = "x-amz-meta-tumor-size";

#[derive(Debug, Clone)]
struct Endpoint {
    scheme: String,
    /// Host header value, with port when non-default.
    host: String,
    /// `/<bucket>` for path-style addressing, empty otherwise.
    path_prefix: String,
}

impl Endpoint {
    fn from_config(config: &StorageConfig) -> Result<Self, StoreError> {
        match config.endpoint_url {
            Some(ref raw) => {
                let url = reqwest::Url::parse(raw)
                    .map_err(|e| StoreError::Config(format!("invalid endpoint_url '{}': {}", raw, e)))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| StoreError::Config(format!("endpoint_url '{}' has no host", raw)))?;
                let host = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                Ok(Self {
                    scheme: url.scheme().to_string(),
                    host,
                    path_prefix: format!("/{}", config.bucket),
                })
            }
            None => Ok(Self {
                scheme: "https".to_string(),
                host: s3_host(&config.bucket, &config.region),
                path_prefix: String::new(),
            }),
        }
    }

    fn base_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path_prefix)
    }
}

/// Virtual-hosted-style S3 hostname.
fn s3_host(bucket: &str, region: &str) -> String {
    if region == "us-east-1" {
        format!("{}.s3.amazonaws.com", bucket)
    } else {
        format!("{}.s3.{}.amazonaws.com", bucket, region)
    }
}

pub struct S3ScanStore {
    client: reqwest::Client,
    config: StorageConfig,
    creds: AwsCredentials,
    layout: KeyLayout,
    endpoint: Endpoint,
}

impl S3ScanStore {
    pub fn new(config: StorageConfig, creds: AwsCredentials) -> Result<Self, StoreError> {
        if config.bucket.trim().is_empty() {
            return Err(StoreError::Config("storage.bucket is not set".to_string()));
        }
        let endpoint = Endpoint::from_config(&config)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = %endpoint.base_url(),
            "S3 scan store configured"
        );

        Ok(Self {
            client,
            layout: KeyLayout::new(&config.prefix),
            config,
            creds,
            endpoint,
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        let encoded = sigv4::uri_encode(key, false);
        match (&self.config.public_base_url, &self.config.endpoint_url) {
            (Some(base), _) => format!("{}/{}", base.trim_end_matches('/'), encoded),
            (None, Some(_)) => format!("{}/{}", self.endpoint.base_url(), encoded),
            (None, None) => format!("https://{}.s3.amazonaws.com/{}", self.config.bucket, encoded),
        }
    }

    async fn send(
        &self,
        method: Method,
        operation: &'static str,
        key: Option<&str>,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<reqwest::Response, StoreError> {
        let canonical_uri = format!(
            "{}/{}",
            self.endpoint.path_prefix,
            key.map(|k| sigv4::uri_encode(k, false)).unwrap_or_default()
        );
        let canonical_query = sigv4::canonical_query(query);

        let signed = sigv4::sign(
            &SignableRequest {
                method: method.as_str(),
                host: &self.endpoint.host,
                canonical_uri: &canonical_uri,
                query,
                headers,
                payload: &body,
            },
            &self.creds,
            &self.config.region,
            Utc::now(),
        );

        let mut url = format!("{}://{}{}", self.endpoint.scheme, self.endpoint.host, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut request = self.client.request(method, &url);
        for (name, value) in &signed {
            request = request.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.unwrap_or(operation).to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Http {
            operation,
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut headers = vec![("content-type".to_string(), content_type.to_string())];
        headers.extend(metadata.iter().cloned());
        self.send(Method::PUT, "PutObject", Some(key), &[], &headers, body)
            .await?;
        debug!(key = %key, "Stored object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<reqwest::Response, StoreError> {
        self.send(Method::GET, "GetObject", Some(key), &[], &[], Bytes::new())
            .await
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        match self
            .send(Method::DELETE, "DeleteObject", Some(key), &[], &[], Bytes::new())
            .await
        {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All keys under `prefix`, following continuation tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self
                .send(Method::GET, "ListObjectsV2", None, &query, &[], Bytes::new())
                .await
                .map_err(|e| match e {
                    // a missing bucket is a configuration problem, not a missing scan
                    StoreError::NotFound(_) => {
                        StoreError::Config(format!("bucket '{}' not found", self.config.bucket))
                    }
                    other => other,
                })?;
            let xml = response.text().await?;
            let (batch, next_token) = parse_list_objects_response(&xml);
            keys.extend(batch);

            match next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    /// Artifacts present under one timestamp's folder.
    async fn artifacts(&self, ts: &ScanTimestamp) -> Result<RecordKeys, StoreError> {
        let keys = self.list_keys(&self.layout.folder(ts)).await?;
        let mut record = RecordKeys::default();
        for key in keys {
            if let Some((_, artifact)) = self.layout.classify(&key) {
                record.add(key, artifact);
            }
        }
        Ok(record)
    }

    async fn write_artifacts(
        &self,
        ts: &ScanTimestamp,
        image: &ScanImage,
        analysis: &Value,
        summary: &str,
        tags: &ScanTags,
        written: &mut Vec<String>,
    ) -> Result<String, StoreError> {
        let image_key = self.layout.image_key(ts, &image.extension);
        self.put_object(&image_key, image.bytes.clone(), &image.content_type, &[])
            .await?;
        written.push(image_key.clone());

        let summary_key = self.layout.summary_key(ts);
        self.put_object(
            &summary_key,
            Bytes::from(summary.to_string()),
            "text/plain; charset=utf-8",
            &[],
        )
        .await?;
        written.push(summary_key);

        // Written last: a record only counts as complete once this exists.
        let body = serde_json::to_vec_pretty(analysis)
            .map_err(|e| StoreError::Malformed(format!("analysis is not serializable: {}", e)))?;
        let metadata = vec![
            (META_TUMOR_TYPE.to_string(), sigv4::uri_encode(&tags.tumor_type, true)),
            (META_TUMOR_SIZE.to_string(), sigv4::uri_encode(&tags.tumor_size, true)),
        ];
        self.put_object(&self.layout.context_key(ts), body.into(), "application/json", &metadata)
            .await?;

        Ok(image_key)
    }

    /// Best-effort removal of a partially written record.
    async fn cleanup(&self, keys: &[String]) {
        for key in keys {
            let strategy = ExponentialBackoff::from_millis(50)
                .max_delay(Duration::from_secs(2))
                .map(jitter)
                .take(self.config.cleanup_retries);

            if let Err(e) = Retry::spawn(strategy, || self.delete_object(key)).await {
                warn!(key = %key, error = %e, "Failed to remove partial upload artifact");
            }
        }
    }

    /// Drop images an earlier put of the same timestamp left under another extension.
    async fn remove_stale_images(&self, existing: &[String], keep: &str) {
        let stale: Vec<String> = existing
            .iter()
            .filter(|key| key.as_str() != keep)
            .filter(|key| matches!(self.layout.classify(key), Some((_, Artifact::Image { .. }))))
            .cloned()
            .collect();
        if !stale.is_empty() {
            self.cleanup(&stale).await;
        }
    }
}

#[derive(Default)]
struct RecordKeys {
    images: Vec<String>,
    summary: Option<String>,
    context: Option<String>,
}

impl RecordKeys {
    fn add(&mut self, key: String, artifact: Artifact) {
        match artifact {
            Artifact::Image { .. } => self.images.push(key),
            Artifact::Summary => self.summary = Some(key),
            Artifact::Context => self.context = Some(key),
        }
    }

    fn is_complete(&self) -> bool {
        !self.images.is_empty() && self.summary.is_some() && self.context.is_some()
    }
}

#[async_trait]
impl ScanStore for S3ScanStore {
    async fn put(
        &self,
        timestamp: &ScanTimestamp,
        image: &ScanImage,
        analysis: &Value,
        summary: &str,
        tags: &ScanTags,
    ) -> Result<String, StoreError> {
        // Keys present before this write belong to an earlier record and survive a failed write.
        let existing = self.list_keys(&self.layout.folder(timestamp)).await?;

        let mut written = Vec::with_capacity(2);
        match self
            .write_artifacts(timestamp, image, analysis, summary, tags, &mut written)
            .await
        {
            Ok(image_key) => {
                self.remove_stale_images(&existing, &image_key).await;
                info!(timestamp = %timestamp, bucket = %self.config.bucket, "Scan persisted");
                Ok(self.public_url(&image_key))
            }
            Err(e) => {
                written.retain(|key| !existing.contains(key));
                warn!(
                    timestamp = %timestamp,
                    written = written.len(),
                    preexisting = existing.len(),
                    error = %e,
                    "Scan upload failed, removing partial artifacts"
                );
                self.cleanup(&written).await;
                Err(e)
            }
        }
    }

    async fn get(&self, timestamp: &ScanTimestamp) -> Result<ScanRecord, StoreError> {
        let keys = self.artifacts(timestamp).await?;
        let (Some(context_key), Some(summary_key), Some(image_key)) =
            (keys.context, keys.summary, keys.images.first())
        else {
            return Err(StoreError::NotFound(timestamp.to_string()));
        };

        let context_response = self.get_object(&context_key).await?;
        let stored_tags = tags_from_headers(context_response.headers());
        let context_bytes = context_response.bytes().await?;
        let analysis: Value = serde_json::from_slice(&context_bytes)
            .map_err(|e| StoreError::Malformed(format!("{}: {}", context_key, e)))?;

        let summary = self.get_object(&summary_key).await?.text().await?;
        let tags = stored_tags.unwrap_or_else(|| ScanTags::from_context(&analysis));

        Ok(ScanRecord {
            timestamp: timestamp.clone(),
            image_url: self.public_url(image_key),
            analysis,
            summary,
            tags,
        })
    }

    async fn image(&self, timestamp: &ScanTimestamp) -> Result<StoredImage, StoreError> {
        let keys = self.artifacts(timestamp).await?;
        let key = keys
            .images
            .first()
            .ok_or_else(|| StoreError::NotFound(timestamp.to_string()))?;

        let response = self.get_object(key).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| {
                key.rsplit_once('.')
                    .and_then(|(_, ext)| content_type_for(&ext.to_ascii_lowercase()))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(StoredImage {
            bytes: response.bytes().await?,
            content_type,
        })
    }

    async fn exists(&self, timestamp: &ScanTimestamp) -> Result<bool, StoreError> {
        let keys = self.list_keys(&self.layout.folder(timestamp)).await?;
        Ok(!keys.is_empty())
    }

    async fn timestamps(&self) -> Result<Vec<ScanTimestamp>, StoreError> {
        let mut records: HashMap<ScanTimestamp, RecordKeys> = HashMap::new();
        for key in self.list_keys(&self.layout.root()).await? {
            if let Some((ts, artifact)) = self.layout.classify(&key) {
                records.entry(ts).or_default().add(key, artifact);
            }
        }

        Ok(records
            .into_iter()
            .filter(|(_, keys)| keys.is_complete())
            .map(|(ts, _)| ts)
            .collect())
    }

    fn name(&self) -> &str {
        "s3"
    }
}

fn tags_from_headers(headers: &reqwest::header::HeaderMap) -> Option<ScanTags> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(sigv4::uri_decode)
    };
    Some(ScanTags {
        tumor_type: read(META_TUMOR_TYPE)?,
        tumor_size: read(META_TUMOR_SIZE)?,
    })
}

// ============ XML Parsing (minimal, no extra deps) ============

/// Keys from a `ListObjectsV2` response plus the continuation token when the
/// listing is truncated.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken").filter(|_| is_truncated);

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, next_token)
}

/// Text content of a simple, non-nested tag, with XML entities decoded.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let value_start = xml.find(&open)? + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(unescape_xml(&xml[value_start..value_start + end]))
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TS: &str = "20240101_120000";

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        }
    }

    fn store_for(server: &MockServer) -> S3ScanStore {
        let config = StorageConfig {
            bucket: "scans".to_string(),
            endpoint_url: Some(server.uri()),
            cleanup_retries: 2,
            ..StorageConfig::default()
        };
        S3ScanStore::new(config, creds()).unwrap()
    }

    fn ts(s: &str) -> ScanTimestamp {
        ScanTimestamp::parse(s).unwrap()
    }

    fn listing(keys: &[String]) -> String {
        let contents: String = keys
            .iter()
            .map(|k| format!("<Contents><Key>{}</Key><Size>1</Size></Contents>", k))
            .collect();
        format!(
            "<?xml version=\"1.0\"?><ListBucketResult><IsTruncated>false</IsTruncated>{}</ListBucketResult>",
            contents
        )
    }

    fn record_keys(ts: &str) -> Vec<String> {
        vec![
            format!("saved/{ts}/context_{ts}.json"),
            format!("saved/{ts}/mri_{ts}.jpg"),
            format!("saved/{ts}/summary_{ts}.txt"),
        ]
    }

    async fn mount_record(server: &MockServer, ts: &str, tumor_type: &str) {
        Mock::given(method("GET"))
            .and(path("/scans/"))
            .and(query_param("prefix", format!("saved/{ts}/")))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&record_keys(ts))))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/scans/saved/{ts}/context_{ts}.json")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(META_TUMOR_TYPE, tumor_type)
                    .insert_header(META_TUMOR_SIZE, "3%20cm")
                    .set_body_json(json!({"tumor_detection": {"present": true, "type": tumor_type}})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/scans/saved/{ts}/summary_{ts}.txt")))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("Summary {ts}")))
            .mount(server)
            .await;
    }

    #[test]
    fn test_parse_list_response_with_continuation() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <NextContinuationToken>abc&amp;def</NextContinuationToken>
            <Contents><Key>saved/20240101_120000/context_20240101_120000.json</Key></Contents>
            <Contents><Key>saved/20240101_120000/</Key></Contents>
        </ListBucketResult>"#;
        let (keys, token) = parse_list_objects_response(xml);
        assert_eq!(keys, vec!["saved/20240101_120000/context_20240101_120000.json"]);
        assert_eq!(token.as_deref(), Some("abc&def"));
    }

    #[test]
    fn test_public_url_defaults_to_virtual_host() {
        let config = StorageConfig {
            bucket: "brain-scans".to_string(),
            region: "eu-west-1".to_string(),
            ..StorageConfig::default()
        };
        let store = S3ScanStore::new(config, creds()).unwrap();
        assert_eq!(store.endpoint.host, "brain-scans.s3.eu-west-1.amazonaws.com");
        assert_eq!(
            store.public_url("saved/20240101_120000/mri_20240101_120000.jpg"),
            "https://brain-scans.s3.amazonaws.com/saved/20240101_120000/mri_20240101_120000.jpg"
        );
    }

    #[test]
    fn test_missing_bucket_is_config_error() {
        let result = S3ScanStore::new(StorageConfig::default(), creds());
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_put_writes_context_last_with_tag_metadata() {
        let server = MockServer::start().await;
        let store = store_for(&server);

        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/mri_{TS}.png")))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/summary_{TS}.txt")))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/context_{TS}.json")))
            .and(header(META_TUMOR_TYPE, "glioma"))
            .and(header(META_TUMOR_SIZE, "3%20cm"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scans/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
            .mount(&server)
            .await;

        let image = ScanImage::new(vec![1u8, 2, 3], Some("brain1.png"));
        let tags = ScanTags {
            tumor_type: "glioma".into(),
            tumor_size: "3 cm".into(),
        };
        let url = store
            .put(&ts(TS), &image, &json!({"tumor_detection": {}}), "A glioma.", &tags)
            .await
            .unwrap();
        assert_eq!(url, format!("{}/scans/saved/{TS}/mri_{TS}.png", server.uri()));

        let puts: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == "PUT")
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(puts.len(), 3);
        assert!(puts[2].ends_with(&format!("context_{TS}.json")));

        let signed = server.received_requests().await.unwrap();
        assert!(signed[0]
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/")));
    }

    #[tokio::test]
    async fn test_failed_summary_write_removes_image_and_skips_context() {
        let server = MockServer::start().await;
        let store = store_for(&server);

        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/mri_{TS}.jpg")))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/summary_{TS}.txt")))
            .respond_with(ResponseTemplate::new(503).set_body_string("SlowDown"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/context_{TS}.json")))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/scans/saved/{TS}/mri_{TS}.jpg")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scans/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
            .mount(&server)
            .await;

        let image = ScanImage::new(vec![1u8], Some("scan.jpg"));
        let tags = ScanTags {
            tumor_type: "none".into(),
            tumor_size: "N/A".into(),
        };
        let err = store
            .put(&ts(TS), &image, &json!({}), "summary", &tags)
            .await
            .unwrap_err();

        match err {
            StoreError::Http { status, operation, .. } => {
                assert_eq!(status, 503);
                assert_eq!(operation, "PutObject");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_rewrite_keeps_earlier_record() {
        let server = MockServer::start().await;
        let store = store_for(&server);
        mount_record(&server, TS, "glioma").await;

        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/mri_{TS}.jpg")))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/scans/saved/{TS}/summary_{TS}.txt")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let image = ScanImage::new(vec![1u8], Some("scan.jpg"));
        let tags = ScanTags {
            tumor_type: "glioma".into(),
            tumor_size: "3 cm".into(),
        };
        let result = store.put(&ts(TS), &image, &json!({}), "summary", &tags).await;
        assert!(matches!(result, Err(StoreError::Http { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_rewrite_with_new_extension_drops_old_image() {
        let server = MockServer::start().await;
        let store = store_for(&server);
        mount_record(&server, TS, "glioma").await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/scans/saved/{TS}/mri_{TS}.jpg")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let image = ScanImage::new(vec![1u8], Some("scan.png"));
        let tags = ScanTags {
            tumor_type: "glioma".into(),
            tumor_size: "3 cm".into(),
        };
        store
            .put(&ts(TS), &image, &json!({}), "summary", &tags)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_aborts_when_folder_listing_fails() {
        let server = MockServer::start().await;
        let store = store_for(&server);

        Mock::given(method("GET"))
            .and(path("/scans/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let image = ScanImage::new(vec![1u8], Some("scan.jpg"));
        let tags = ScanTags {
            tumor_type: "none".into(),
            tumor_size: "N/A".into(),
        };
        assert!(store.put(&ts(TS), &image, &json!({}), "summary", &tags).await.is_err());
    }

    #[tokio::test]
    async fn test_list_skips_incomplete_records_and_orders_newest_first() {
        let server = MockServer::start().await;
        let store = store_for(&server);

        let mut all = record_keys("20240101_120000");
        all.extend(record_keys("20240301_080000"));
        // image only: an upload that never finished
        all.push("saved/20240401_000000/mri_20240401_000000.jpg".to_string());
        all.push("saved/readme.txt".to_string());

        Mock::given(method("GET"))
            .and(path("/scans/"))
            .and(query_param("prefix", "saved/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&all)))
            .mount(&server)
            .await;
        mount_record(&server, "20240101_120000", "glioma").await;
        mount_record(&server, "20240301_080000", "meningioma").await;

        let records: Vec<ScanRecord> = store.list().try_collect().await.unwrap();
        let order: Vec<&str> = records.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(order, vec!["20240301_080000", "20240101_120000"]);

        assert_eq!(records[0].tags.tumor_type, "meningioma");
        assert_eq!(records[0].tags.tumor_size, "3 cm");
        assert_eq!(records[0].summary, "Summary 20240301_080000");
        assert!(records[1].image_url.ends_with("mri_20240101_120000.jpg"));
    }

    #[tokio::test]
    async fn test_listing_follows_continuation_tokens() {
        let server = MockServer::start().await;
        let store = store_for(&server);

        let first = format!(
            "<ListBucketResult><IsTruncated>true</IsTruncated><NextContinuationToken>page2</NextContinuationToken>{}</ListBucketResult>",
            record_keys("20240101_120000")
                .iter()
                .map(|k| format!("<Contents><Key>{}</Key></Contents>", k))
                .collect::<String>()
        );
        Mock::given(method("GET"))
            .and(path("/scans/"))
            .and(query_param("continuation-token", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&record_keys("20240102_090000"))))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scans/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(first))
            .with_priority(5)
            .mount(&server)
            .await;

        let mut found = store.timestamps().await.unwrap();
        found.sort();
        let found: Vec<&str> = found.iter().map(|t| t.as_str()).collect();
        assert_eq!(found, vec!["20240101_120000", "20240102_090000"]);
    }

    #[tokio::test]
    async fn test_get_unknown_timestamp_is_not_found() {
        let server = MockServer::start().await;
        let store = store_for(&server);

        Mock::given(method("GET"))
            .and(path("/scans/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
            .mount(&server)
            .await;

        let err = store.get(&ts(TS)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref t) if t == TS));
        assert!(!store.exists(&ts(TS)).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_tag_metadata_falls_back_to_analysis() {
        let server = MockServer::start().await;
        let store = store_for(&server);

        Mock::given(method("GET"))
            .and(path("/scans/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&record_keys(TS))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/scans/saved/{TS}/context_{TS}.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tumor_detection": {"present": true, "type": "Pituitary", "size_description": "1 cm"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/scans/saved/{TS}/summary_{TS}.txt")))
            .respond_with(ResponseTemplate::new(200).set_body_string("Small pituitary lesion."))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/scans/saved/{TS}/mri_{TS}.jpg")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0xFFu8, 0xD8]),
            )
            .mount(&server)
            .await;

        let record = store.get(&ts(TS)).await.unwrap();
        assert_eq!(record.tags.tumor_type, "Pituitary");
        assert_eq!(record.tags.tumor_size, "1 cm");

        let image = store.image(&ts(TS)).await.unwrap();
        assert_eq!(image.content_type, "image/jpeg");
        assert_eq!(image.bytes.as_ref(), &[0xFF, 0xD8]);
    }
}
