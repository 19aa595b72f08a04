//! Message Router
//!
//! Parses newline-delimited client JSON into typed requests and dispatches
//! them against the orchestrator. Unknown tags never reach the orchestrator:
//! they are rejected at the parse boundary and surfaced back to the sending
//! client as an `error` event.

use std::sync::Arc;

use appforge_core::events::{AgentEvent, ClientRequest};
use tracing::debug;

use crate::agent::orchestrator::Orchestrator;
use crate::agent::state_machine::DEFAULT_REVIEW_CYCLES;
use crate::utils::error::AppResult;

/// Stateless dispatcher for one orchestrator instance.
pub struct MessageRouter {
    agent: Arc<Orchestrator>,
}

impl MessageRouter {
    pub fn new(agent: Arc<Orchestrator>) -> Self {
        Self { agent }
    }

    /// Parse one wire line into a typed request.
    pub fn parse(line: &str) -> Result<ClientRequest, String> {
        serde_json::from_str(line).map_err(|e| format!("unrecognized client message: {e}"))
    }

    /// Handle one raw line from `client_id`. Parse failures are answered
    /// with an `error` event to that client only.
    pub async fn route_line(&self, client_id: &str, line: &str) -> AppResult<()> {
        match Self::parse(line) {
            Ok(request) => self.dispatch(client_id, request).await,
            Err(message) => {
                self.agent
                    .deps()
                    .broadcaster
                    .send_to(client_id, &AgentEvent::Error { message });
                Ok(())
            }
        }
    }

    /// Dispatch a typed request.
    pub async fn dispatch(&self, client_id: &str, request: ClientRequest) -> AppResult<()> {
        debug!(%client_id, request = ?request, "client request");
        match request {
            ClientRequest::Preview => {
                let _ = self.agent.preview().await;
            }
            ClientRequest::GenerateAll => {
                let agent = Arc::clone(&self.agent);
                tokio::spawn(async move {
                    let _ = agent.generate_all_files(DEFAULT_REVIEW_CYCLES).await;
                });
            }
            ClientRequest::StopGeneration => {
                self.agent.stop_generation()?;
            }
            ClientRequest::ResumeGeneration => {
                self.agent.resume_generation()?;
            }
            ClientRequest::ClearConversation => {
                self.agent.clear_conversation()?;
            }
            ClientRequest::UserSuggestion { message, images } => {
                let agent = Arc::clone(&self.agent);
                tokio::spawn(async move {
                    let _ = agent.handle_user_input(&message, images).await;
                });
            }
            ClientRequest::GetModelConfigs => {
                self.agent.deps().broadcaster.send_to(
                    client_id,
                    &AgentEvent::ModelConfigsInfo {
                        configs: self.agent.model_configs(),
                    },
                );
            }
            ClientRequest::TerminalCommand { command } => {
                let agent = Arc::clone(&self.agent);
                tokio::spawn(async move {
                    let _ = agent.exec_commands(&[command], true, None).await;
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tags() {
        assert_eq!(
            MessageRouter::parse(r#"{"type":"generate_all"}"#).unwrap(),
            ClientRequest::GenerateAll
        );
        assert_eq!(
            MessageRouter::parse(r#"{"type":"terminal_command","command":"bun test"}"#).unwrap(),
            ClientRequest::TerminalCommand {
                command: "bun test".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let err = MessageRouter::parse(r#"{"type":"self_destruct"}"#).unwrap_err();
        assert!(err.contains("unrecognized client message"));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(MessageRouter::parse("{not json").is_err());
    }
}
