//! Scripted provider: deterministic turns for tests and offline runs.
//!
//! Each call to `stream()` pops the next [`TurnScript`] and replays it
//! through an [`EventStream`], so cancellation and the stream state table
//! behave exactly as they do for a network backend.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use turnloop_core::error::{ProviderError, StreamError};
use turnloop_core::message::{ContentBlock, Message, StopReason, Usage};
use turnloop_core::provider::{Provider, Request};
use turnloop_core::stream::{Event, EventStream, Stream};

/// One element of a scripted turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(Event),
    /// Fail the stream with this error
    Fail(StreamError),
    /// Never produce anything again; only cancellation gets past this
    Stall,
}

/// The events one model turn will produce.
#[derive(Debug, Clone, Default)]
pub struct TurnScript {
    steps: Vec<ScriptStep>,
}

impl TurnScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain answer: one text delta, usage, `end_turn`.
    pub fn text(reply: impl Into<String>) -> Self {
        Self::new()
            .event(Event::text(0, reply))
            .event(Event::Usage(Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Usage::default()
            }))
            .event(Event::stop(StopReason::EndTurn, "end_turn"))
    }

    /// A turn that calls each `(id, name, arguments)` in order and stops
    /// for tool use.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut script = Self::new();
        for (index, (id, name, arguments)) in calls.iter().enumerate() {
            script = script
                .event(Event::tool_call_start(index, *id, *name))
                .event(Event::tool_call_arguments(index, *arguments));
        }
        script.event(Event::stop(StopReason::ToolUse, "tool_use"))
    }

    pub fn event(mut self, event: Event) -> Self {
        self.steps.push(ScriptStep::Event(event));
        self
    }

    pub fn fail(mut self, error: StreamError) -> Self {
        self.steps.push(ScriptStep::Fail(error));
        self
    }

    pub fn stall(mut self) -> Self {
        self.steps.push(ScriptStep::Stall);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A [`Provider`] that replays queued scripts.
///
/// When the queue runs dry it either fails to open (`new`) or echoes the
/// last user message (`echo`).
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<TurnScript>>,
    open_failure: Mutex<Option<ProviderError>>,
    requests: Mutex<Vec<Request>>,
    delay: Option<Duration>,
    echo: bool,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<TurnScript>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            open_failure: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            delay: None,
            echo: false,
        }
    }

    /// Replies to every turn by echoing the last user text.
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::new(Vec::new())
        }
    }

    /// Sleep this long before every scripted step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `stream()` call fail before producing a stream.
    pub fn fail_next_open(&self, error: ProviderError) {
        *lock(&self.open_failure) = Some(error);
    }

    pub fn push_turn(&self, turn: TurnScript) {
        lock(&self.turns).push_back(turn);
    }

    /// Number of `stream()` calls that passed validation.
    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }

    fn echo_turn(request: &Request) -> TurnScript {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User(user) => Some(
                    user.content
                        .iter()
                        .filter_map(|block| match block {
                            ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<String>(),
                ),
                _ => None,
            })
            .unwrap_or_default();
        TurnScript::text(format!("echo: {last_user}"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        cancel: CancellationToken,
        request: Request,
    ) -> Result<Box<dyn Stream>, ProviderError> {
        request.validate()?;
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        lock(&self.requests).push(request.clone());

        if let Some(error) = lock(&self.open_failure).take() {
            return Err(error);
        }

        let script = match lock(&self.turns).pop_front() {
            Some(script) => script,
            None if self.echo => Self::echo_turn(&request),
            None => {
                return Err(ProviderError::NotConfigured(
                    "scripted provider has no turns left".into(),
                ));
            }
        };

        debug!(steps = script.len(), "Replaying scripted turn");

        let delay = self.delay;
        let source = futures::stream::unfold(script.steps.into_iter(), move |mut steps| async move {
            let Some(step) = steps.next() else {
                return None;
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match step {
                ScriptStep::Event(event) => Some((Ok(event), steps)),
                ScriptStep::Fail(error) => Some((Err(error), steps)),
                ScriptStep::Stall => {
                    futures::future::pending::<()>().await;
                    None
                }
            }
        });

        let mut stream = EventStream::new(source, cancel);
        if let Some(model) = request.model {
            stream = stream.with_model(model);
        }
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnloop_core::stream::StreamState;

    async fn drain(stream: &mut Box<dyn Stream>) -> usize {
        let mut count = 0;
        while let Some(item) = stream.next().await {
            if item.is_ok() {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn replays_turns_in_order() {
        let provider = ScriptedProvider::new(vec![
            TurnScript::text("first"),
            TurnScript::tool_calls(&[("tc_1", "read", r#"{"path":"a"}"#)]),
        ]);

        let mut stream = provider
            .stream(CancellationToken::new(), Request::default())
            .await
            .unwrap();
        assert_eq!(drain(&mut stream).await, 3);
        assert_eq!(stream.state(), StreamState::Complete);
        assert_eq!(stream.message().unwrap().text(), "first");

        let mut stream = provider
            .stream(CancellationToken::new(), Request::default())
            .await
            .unwrap();
        drain(&mut stream).await;
        let message = stream.message().unwrap();
        assert_eq!(message.stop_reason, StopReason::ToolUse);
        assert_eq!(message.tool_calls()[0].arguments, r#"{"path":"a"}"#);

        let err = provider
            .stream(CancellationToken::new(), Request::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn invalid_request_is_not_recorded() {
        let provider = ScriptedProvider::new(vec![TurnScript::text("unused")]);
        let request = Request {
            temperature: Some(3.5),
            ..Request::default()
        };
        let err = provider
            .stream(CancellationToken::new(), request)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn open_failure_is_one_shot() {
        let provider = ScriptedProvider::new(vec![TurnScript::text("after")]);
        provider.fail_next_open(ProviderError::Network("refused".into()));

        assert!(
            provider
                .stream(CancellationToken::new(), Request::default())
                .await
                .is_err()
        );
        assert!(
            provider
                .stream(CancellationToken::new(), Request::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn stall_yields_to_cancellation() {
        let provider =
            ScriptedProvider::new(vec![TurnScript::new().event(Event::text(0, "wait")).stall()]);
        let cancel = CancellationToken::new();
        let mut stream = provider
            .stream(cancel.clone(), Request::default())
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(Ok(_))));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert_eq!(stream.next().await, Some(Err(StreamError::Cancelled)));
        assert_eq!(stream.message().unwrap().stop_reason, StopReason::Aborted);
    }

    #[tokio::test]
    async fn echo_mode_repeats_last_user_message() {
        let provider = ScriptedProvider::echo();
        let request = Request {
            messages: vec![Message::user("ping")],
            ..Request::default()
        };
        let mut stream = provider
            .stream(CancellationToken::new(), request)
            .await
            .unwrap();
        drain(&mut stream).await;
        assert_eq!(stream.message().unwrap().text(), "echo: ping");
    }

    #[tokio::test]
    async fn model_override_is_reported() {
        let provider = ScriptedProvider::new(vec![TurnScript::text("hi")]);
        let request = Request {
            model: Some("scripted-1".into()),
            ..Request::default()
        };
        let mut stream = provider
            .stream(CancellationToken::new(), request)
            .await
            .unwrap();
        drain(&mut stream).await;
        assert_eq!(
            stream.message().unwrap().model.as_deref(),
            Some("scripted-1")
        );
    }
}
