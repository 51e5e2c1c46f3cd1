use async_trait::async_trait;
use serde::Serialize;
use visitproof_domain::model::{MediaUrl, OcrData};
use visitproof_domain::receipt::{OcrProvider, OcrTransportError};

/// Client for the external OCR service. Transport problems surface as
/// `OcrTransportError`; the verifier records them as a terminal failure
/// with its own tag. The overall deadline lives in `ReceiptPolicy`, so
/// the client itself carries no timeout.
pub struct HttpOcrClient {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OcrRequestBody<'a> {
    media_url: &'a str,
}

impl HttpOcrClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl OcrProvider for HttpOcrClient {
    async fn perform_ocr(&self, media_url: &MediaUrl) -> Result<OcrData, OcrTransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&OcrRequestBody {
                media_url: media_url.as_str(),
            })
            .send()
            .await
            .map_err(|err| OcrTransportError::Request(err.to_string()))?
            .error_for_status()
            .map_err(|err| OcrTransportError::Request(err.to_string()))?;

        response
            .json::<OcrData>()
            .await
            .map_err(|err| OcrTransportError::Request(err.to_string()))
    }
}
