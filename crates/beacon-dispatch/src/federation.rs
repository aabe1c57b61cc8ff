use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::queue::{Deliver, DeliveryJob, DispatchQueue, QueueSizing};

const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";
const SIGNED_HEADERS: &str = "(request-target) host date digest";

/// Sends prepared requests with a shared client. Non-2xx is a failure.
pub struct HttpDeliverer {
    client: reqwest::Client,
}

impl HttpDeliverer {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Deliver<reqwest::Request> for HttpDeliverer {
    async fn deliver(&self, _target: &str, request: reqwest::Request) -> Result<(), DispatchError> {
        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status));
        }
        Ok(())
    }
}

/// Signs a fully built request in place, before it is queued.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &mut reqwest::Request) -> Result<(), DispatchError>;
}

/// HTTP Signatures (draft-cavage) with rsa-sha256, as expected by
/// ActivityPub servers.
pub struct HttpSignatureSigner {
    key_id: String,
    key: SigningKey<Sha256>,
}

impl HttpSignatureSigner {
    pub fn new(actor_iri: &str, private_key: RsaPrivateKey) -> Self {
        Self {
            key_id: format!("{}#main-key", actor_iri),
            key: SigningKey::<Sha256>::new(private_key),
        }
    }

    /// Load a PKCS#8 PEM private key.
    pub fn from_pem(actor_iri: &str, pem: &str) -> Result<Self, DispatchError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| DispatchError::Signing(format!("invalid private key: {}", e)))?;
        Ok(Self::new(actor_iri, private_key))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl RequestSigner for HttpSignatureSigner {
    fn sign(&self, request: &mut reqwest::Request) -> Result<(), DispatchError> {
        let url = request.url();
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(DispatchError::Signing("request has no host".into())),
        };
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let body = request.body().and_then(|b| b.as_bytes()).unwrap_or_default();
        let digest = format!("SHA-256={}", STANDARD.encode(Sha256::digest(body)));
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let signing_string = signing_string(
            request.method().as_str(),
            &target,
            &host,
            &date,
            &digest,
        );
        let signature = STANDARD.encode(self.key.sign(signing_string.as_bytes()).to_bytes());

        let header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id, SIGNED_HEADERS, signature
        );

        let headers = request.headers_mut();
        headers.insert(reqwest::header::HOST, header_value(&host)?);
        headers.insert(reqwest::header::DATE, header_value(&date)?);
        headers.insert(HeaderName::from_static("digest"), header_value(&digest)?);
        headers.insert(HeaderName::from_static("signature"), header_value(&header)?);

        Ok(())
    }
}

fn signing_string(method: &str, target: &str, host: &str, date: &str, digest: &str) -> String {
    format!(
        "(request-target): {} {}\nhost: {}\ndate: {}\ndigest: {}",
        method.to_lowercase(),
        target,
        host,
        date,
        digest
    )
}

fn header_value(value: &str) -> Result<HeaderValue, DispatchError> {
    HeaderValue::from_str(value).map_err(|e| DispatchError::Signing(e.to_string()))
}

/// Builds, signs and queues ActivityPub deliveries.
#[derive(Clone)]
pub struct Outbox {
    queue: DispatchQueue<reqwest::Request>,
    client: reqwest::Client,
    signer: Arc<dyn RequestSigner>,
}

impl Outbox {
    pub fn start(client: reqwest::Client, signer: Arc<dyn RequestSigner>, sizing: QueueSizing) -> Self {
        let deliverer = Arc::new(HttpDeliverer::new(client.clone()));
        let queue = DispatchQueue::start("ActivityPub", sizing, deliverer);
        Self {
            queue,
            client,
            signer,
        }
    }

    /// Sign and queue one activity for `inbox`. Returns once it is queued,
    /// not once it is delivered.
    pub async fn deliver_activity(
        &self,
        inbox: &str,
        activity: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        let request = self.build_request(inbox, activity)?;
        self.queue.enqueue(DeliveryJob::new(inbox, request)).await
    }

    /// Queue the same activity for each inbox. Returns how many were queued.
    pub async fn deliver_to_inboxes(&self, inboxes: &[String], activity: &serde_json::Value) -> usize {
        let mut queued = 0;
        for inbox in inboxes {
            match self.deliver_activity(inbox, activity).await {
                Ok(()) => queued += 1,
                Err(e) => warn!("Skipping ActivityPub delivery to {}: {}", inbox, e),
            }
        }
        info!("Queued activity for {}/{} inboxes", queued, inboxes.len());
        queued
    }

    fn build_request(
        &self,
        inbox: &str,
        activity: &serde_json::Value,
    ) -> Result<reqwest::Request, DispatchError> {
        let body = serde_json::to_vec(activity)?;
        let mut request = self
            .client
            .post(inbox)
            .header(CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)
            .header(ACCEPT, ACTIVITY_CONTENT_TYPE)
            .body(body)
            .build()?;
        self.signer.sign(&mut request)?;
        Ok(request)
    }
}
