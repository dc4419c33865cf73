//! Azure Speech REST adapter for synthesis and the voice catalogue.
//!
//! Text is wrapped in SSML (with an `mstts:express-as` style when one is
//! requested) and posted to the regional text-to-speech endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{VoiceFilter, VoiceProfile};

use super::{
    escape_xml, ProviderError, ProviderResult, SpeechSynthesizer, SynthesizedAudio, VoiceCatalog,
};

/// 16 kHz, 32 kbit/s mono MP3
pub const DEFAULT_OUTPUT_FORMAT: &str = "audio-16khz-32kbitrate-mono-mp3";

/// Azure Speech client
pub struct AzureSpeechAdapter {
    region: String,
    key: String,
    output_format: String,

    /// Overrides `https://{region}.tts.speech.microsoft.com`
    base_url: Option<String>,

    client: reqwest::Client,
}

/// Entry of the `voices/list` response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureVoice {
    short_name: String,
    gender: String,
    locale: String,
    #[serde(default)]
    style_list: Vec<String>,
}

impl From<AzureVoice> for VoiceProfile {
    fn from(v: AzureVoice) -> Self {
        VoiceProfile {
            name: v.short_name,
            gender: v.gender,
            locale: v.locale,
            styles: v.style_list,
        }
    }
}

impl AzureSpeechAdapter {
    pub fn new(region: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            key: key.into(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            base_url: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_output_format(mut self, output_format: impl Into<String>) -> Self {
        self.output_format = output_format.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Build API URL
    fn api_url(&self, path: &str) -> String {
        match self.base_url {
            Some(ref base) => format!("{}/cognitiveservices/{}", base.trim_end_matches('/'), path),
            None => format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/{}",
                self.region, path
            ),
        }
    }

    fn ensure_credentials(&self) -> ProviderResult<()> {
        if self.key.trim().is_empty() {
            return Err(ProviderError::permanent("speech key is not configured (SPEECH_KEY)"));
        }
        if self.region.trim().is_empty() && self.base_url.is_none() {
            return Err(ProviderError::permanent(
                "speech region is not configured (SPEECH_REGION)",
            ));
        }
        Ok(())
    }
}

/// SSML for one utterance
pub fn build_ssml(text: &str, voice_name: &str, voice_style: Option<&str>) -> String {
    let text = escape_xml(text);
    let voice_name = escape_xml(voice_name);
    let body = match voice_style {
        Some(style) => format!(
            "<mstts:express-as style=\"{}\">{}</mstts:express-as>",
            escape_xml(style),
            text
        ),
        None => text,
    };

    format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" \
         xmlns:mstts=\"https://www.w3.org/2001/mstts\" xml:lang=\"en-US\">\
         <voice name=\"{}\">{}</voice></speak>",
        voice_name, body
    )
}

/// Map an HTTP failure onto retry semantics
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("Azure Speech returned {}: {}", status, body.trim());
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_builder() {
        ProviderError::permanent(format!("Invalid Azure Speech request: {}", err))
    } else {
        ProviderError::transient(format!("Azure Speech request failed: {}", err))
    }
}

#[async_trait]
impl SpeechSynthesizer for AzureSpeechAdapter {
    fn name(&self) -> &str {
        "azure_speech"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice_name: &str,
        voice_style: Option<&str>,
    ) -> ProviderResult<SynthesizedAudio> {
        self.ensure_credentials()?;

        let ssml = build_ssml(text, voice_name, voice_style);
        debug!(voice = voice_name, style = ?voice_style, chars = text.len(), "Synthesizing speech");

        let response = self
            .client
            .post(self.api_url("v1"))
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", &self.output_format)
            .header("User-Agent", "castwright")
            .body(ssml)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let data = response.bytes().await.map_err(classify_transport)?.to_vec();
        if data.is_empty() {
            return Err(ProviderError::transient("Azure Speech returned no audio"));
        }

        Ok(SynthesizedAudio {
            data,
            duration_ms: None,
        })
    }
}

#[async_trait]
impl VoiceCatalog for AzureSpeechAdapter {
    async fn list_voices(&self, filter: &VoiceFilter) -> ProviderResult<Vec<VoiceProfile>> {
        self.ensure_credentials()?;

        let response = self
            .client
            .get(self.api_url("voices/list"))
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let voices: Vec<AzureVoice> = response.json().await.map_err(|e| {
            ProviderError::transient(format!("Failed to parse Azure voice list: {}", e))
        })?;

        Ok(voices
            .into_iter()
            .map(VoiceProfile::from)
            .filter(|v| filter.matches(v))
            .collect())
    }
}
