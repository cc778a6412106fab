use std::sync::Arc;
use std::time::Duration;

mod provider;
mod rig_adapter;
mod scripted;

pub use provider::{
    InlineAttachment, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, ReplyRequest, Role, StreamEventMapped,
    StreamEventPayload, StreamTarget, TokenSource,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptOutcome, ScriptedSource};

const OFFLINE_REPLY: &str =
    "This is an offline reply. Configure an API key to talk to a real model.";
const OFFLINE_CHUNK_DELAY: Duration = Duration::from_millis(40);

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn TokenSource>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(
            ScriptedSource::from_text(OFFLINE_REPLY).with_chunk_delay(OFFLINE_CHUNK_DELAY),
        )),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_rejected() {
        let config = ProviderConfig::new("carrier-pigeon", "key", "");
        let error = create_provider(config).err();
        assert!(matches!(
            error,
            Some(ProviderError::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn blank_provider_defaults_to_openai_and_requires_key() {
        let config = ProviderConfig::new("  ", "", "");
        let error = create_provider(config).err();
        assert!(matches!(error, Some(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn scripted_provider_needs_no_key() {
        let source = create_provider(ProviderConfig::new("scripted", "", "")).unwrap();
        assert_eq!(source.id(), SCRIPTED_PROVIDER_ID);
    }
}
