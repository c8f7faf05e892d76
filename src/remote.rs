//! Remote collaborators over an OpenAI-compatible chat completions API.
//!
//! - `RemotePlateRecognizer`: vision model reads the plate from a JPEG crop
//! - `RemoteReportGenerator`: language model writes the violation narrative
//!
//! Both share a blocking `ChatClient`. Neither retries; failures surface as
//! errors and the pipeline degrades them (empty plate, placeholder report).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::RemoteSettings;
use crate::frame::PlateImage;
use crate::plate::PlateRecognizer;
use crate::report::{ReportGenerator, ReportRequest};

/// Reply the OCR prompt asks for when no plate is legible.
pub const NO_PLATE: &str = "NO_PLATE";

const OCR_SYSTEM_PROMPT: &str = "You are an automatic license plate recognition system. \
Identify the license plate number visible in the image and reply with its characters only. \
If no plate is clearly visible, reply with NO_PLATE.";

const OCR_USER_PROMPT: &str = "What is the license plate number?";

const REPORT_SYSTEM_PROMPT: &str = "You write formal traffic violation reports. \
Given the plate, measured speed, speed limit and registry data for one speeding vehicle, \
write a 4 to 6 sentence report stating the offence, the applicable traffic regulation, \
the proposed fine and any corrective measure. Be precise and do not invent figures.";

pub struct ChatClient {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(anyhow!("remote base_url must not be empty"));
        }
        if api_key.trim().is_empty() {
            return Err(anyhow!("remote api key must not be empty"));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    /// Build a client from settings, reading the key from the configured env var.
    pub fn from_settings(settings: &RemoteSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .with_context(|| format!("{} is not set", settings.api_key_env))?;
        Self::new(&settings.base_url, api_key, settings.timeout)
    }

    /// Send one chat request and return the first choice's text.
    pub fn complete(&self, model: &str, messages: Value) -> Result<String> {
        let body = json!({ "model": model, "messages": messages, "temperature": 0.2 });
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Content-Type", "application/json")
            .send_string(&body.to_string())
            .with_context(|| format!("chat request to {} failed", self.endpoint))?;
        let raw = response
            .into_string()
            .context("failed to read chat response body")?;
        parse_completion(&raw)
    }
}

fn parse_completion(raw: &str) -> Result<String> {
    let parsed: ChatResponse =
        serde_json::from_str(raw).map_err(|e| anyhow!("invalid chat response: {}", e))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| anyhow!("chat response has no content"))
}

/// Map a raw OCR reply onto a plate string; empty means no plate.
fn normalize_ocr_reply(reply: &str) -> String {
    let text = reply.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();
    if text.eq_ignore_ascii_case(NO_PLATE) {
        String::new()
    } else {
        text.to_string()
    }
}

pub struct RemotePlateRecognizer {
    client: ChatClient,
    model: String,
}

impl RemotePlateRecognizer {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl PlateRecognizer for RemotePlateRecognizer {
    fn name(&self) -> &'static str {
        "remote-vision"
    }

    fn recognize(&self, image: &PlateImage) -> Result<String> {
        let jpeg = image.to_jpeg()?;
        let data_url = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(jpeg)
        );
        let messages = json!([
            { "role": "system", "content": OCR_SYSTEM_PROMPT },
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": OCR_USER_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }
        ]);
        let reply = self.client.complete(&self.model, messages)?;
        Ok(normalize_ocr_reply(&reply))
    }
}

pub struct RemoteReportGenerator {
    client: ChatClient,
    model: String,
}

impl RemoteReportGenerator {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl ReportGenerator for RemoteReportGenerator {
    fn name(&self) -> &'static str {
        "remote-llm"
    }

    fn explain(&self, request: &ReportRequest<'_>) -> Result<String> {
        let registry = match request.vehicle {
            Some(vehicle) => serde_json::to_string(vehicle)?,
            None => "not found in the vehicle registry".to_string(),
        };
        let prompt = format!(
            "Speeding violation detected:\n- Plate: {}\n- Measured speed: {:.2} km/h\n\
             - Speed limit: {:.0} km/h\n- Exceeded by: {:.2} km/h\n\nOwner record: {}\n\n\
             Explain this {:.2} km/h excess under the traffic regulations.",
            request.plate,
            request.speed,
            request.speed_limit,
            request.exceed_speed(),
            registry,
            request.exceed_speed()
        );
        let messages = json!([
            { "role": "system", "content": REPORT_SYSTEM_PROMPT },
            { "role": "user", "content": prompt }
        ]);
        self.client.complete(&self.model, messages)
    }
}
