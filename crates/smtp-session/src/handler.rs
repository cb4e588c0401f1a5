//! Correlates inbound responses with the session's one outstanding
//! submission.
use crate::error::SessionError;
use crate::response::Response;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Completion handle for an outstanding submission. Resolves with the
/// submission's responses in arrival order, or with the failure that
/// tore the expectation down.
pub type ResponseFuture = oneshot::Receiver<Result<Vec<Response>, SessionError>>;

/// At most one submission is outstanding per session: SMTP is
/// half-duplex at the command level, and even under PIPELINING the
/// client sends a batch and then awaits exactly one response per wire
/// unit. The handler holds that single expectation, accumulates
/// responses until the expected count is reached, and fails the
/// expectation on error, connection loss, or timeout.
pub struct ResponseHandler {
    connection_id: String,
    read_timeout: Duration,
    pending: Mutex<Option<PendingResponse>>,
    generation: AtomicU64,
}

struct PendingResponse {
    expected: usize,
    received: Vec<Response>,
    debug: String,
    tx: oneshot::Sender<Result<Vec<Response>, SessionError>>,
    timer: AbortHandle,
    generation: u64,
}

impl ResponseHandler {
    pub fn new(connection_id: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            connection_id: connection_id.into(),
            read_timeout,
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Reserve the session's expectation slot for `expected`
    /// responses. Fails without disturbing the slot when an earlier
    /// submission is still outstanding.
    ///
    /// Must be called from within a tokio runtime: each expectation
    /// arms its own timeout timer.
    pub fn create_response_future(
        self: &Arc<Self>,
        expected: usize,
        debug: impl Into<String>,
    ) -> Result<ResponseFuture, SessionError> {
        debug_assert!(expected >= 1, "an expectation must await at least one response");

        let debug = debug.into();
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock();
        if let Some(existing) = pending.as_ref() {
            return Err(SessionError::ResponsePending(format!(
                "[{}] Cannot wait for a response to [{debug}] because \
                 we're still waiting for a response to [{}]",
                self.connection_id, existing.debug
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = {
            let handler = Arc::clone(self);
            let read_timeout = self.read_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(read_timeout).await;
                handler.expectation_timed_out(generation);
            })
            .abort_handle()
        };

        *pending = Some(PendingResponse {
            expected,
            received: Vec::with_capacity(expected),
            debug,
            tx,
            timer,
            generation,
        });

        Ok(rx)
    }

    /// Deliver one response read off the connection. With nothing
    /// outstanding the response cannot be correlated and is dropped.
    pub fn on_response(&self, response: Response) {
        let completed = {
            let mut pending = self.pending.lock();
            let complete = match pending.as_mut() {
                None => {
                    tracing::debug!(
                        "[{}] Discarding response received with no submission outstanding: {}",
                        self.connection_id,
                        response.to_single_line()
                    );
                    false
                }
                Some(current) => {
                    current.received.push(response);
                    current.received.len() == current.expected
                }
            };
            if complete {
                pending.take()
            } else {
                None
            }
        };

        if let Some(current) = completed {
            current.timer.abort();
            let _ = current.tx.send(Ok(current.received));
        }
    }

    /// Fail any outstanding expectation with a transport error.
    pub fn on_exception(&self, error: SessionError) {
        self.fail_pending(|_| error);
    }

    /// The connection went away while (possibly) waiting.
    pub fn on_channel_inactive(&self) {
        let connection_id = &self.connection_id;
        self.fail_pending(|debug| {
            SessionError::ChannelClosed(format!(
                "[{connection_id}] Handled channelInactive while waiting \
                 for a response to [{debug}]"
            ))
        });
    }

    pub fn is_response_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn fail_pending(&self, make_error: impl FnOnce(&str) -> SessionError) {
        let pending = self.pending.lock().take();
        if let Some(current) = pending {
            current.timer.abort();
            let _ = current.tx.send(Err(make_error(&current.debug)));
        }
    }

    fn expectation_timed_out(&self, generation: u64) {
        let timed_out = {
            let mut pending = self.pending.lock();
            let expired =
                matches!(pending.as_ref(), Some(current) if current.generation == generation);
            if expired {
                pending.take()
            } else {
                None
            }
        };

        if let Some(current) = timed_out {
            let message = format!(
                "[{}] Timed out waiting for a response to [{}]",
                self.connection_id, current.debug
            );
            tracing::debug!("{message}");
            let _ = current.tx.send(Err(SessionError::ReadTimeout(message)));
        }
    }
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ResponseHandler")
            .field("connection_id", &self.connection_id)
            .field("read_timeout", &self.read_timeout)
            .field("response_pending", &self.is_response_pending())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TWO_MINUTES: Duration = Duration::from_secs(120);

    fn handler() -> Arc<ResponseHandler> {
        Arc::new(ResponseHandler::new("connection#1", TWO_MINUTES))
    }

    fn ok_response(content: &str) -> Response {
        Response {
            code: 250,
            enhanced_code: None,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn completes_with_a_response_when_handled() {
        let handler = handler();
        let future = handler.create_response_future(1, "NOOP").unwrap();

        handler.on_response(ok_response("OK"));

        let responses = future.await.unwrap().unwrap();
        assert_eq!(responses, vec![ok_response("OK")]);
    }

    #[tokio::test]
    async fn accumulates_multiple_responses_in_arrival_order() {
        let handler = handler();
        let mut future = handler.create_response_future(3, "MAIL RCPT DATA").unwrap();

        handler.on_response(ok_response("1"));
        assert!(future.try_recv().is_err());
        assert!(handler.is_response_pending());

        handler.on_response(ok_response("2"));
        handler.on_response(ok_response("3"));

        let responses = future.await.unwrap().unwrap();
        assert_eq!(
            responses,
            vec![ok_response("1"), ok_response("2"), ok_response("3")]
        );
        assert!(!handler.is_response_pending());
    }

    #[tokio::test]
    async fn only_one_expectation_at_a_time() {
        let handler = handler();
        let first = handler.create_response_future(1, "old").unwrap();

        let err = handler.create_response_future(1, "new").unwrap_err();
        assert_eq!(
            err.to_string(),
            "[connection#1] Cannot wait for a response to [new] because \
             we're still waiting for a response to [old]"
        );

        // The first expectation is undisturbed
        handler.on_response(ok_response("OK"));
        let responses = first.await.unwrap().unwrap();
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn multi_response_expectations_also_block_new_ones() {
        let handler = handler();
        let _first = handler.create_response_future(2, "old").unwrap();

        let err = handler.create_response_future(1, "new").unwrap_err();
        assert!(matches!(err, SessionError::ResponsePending(_)));
    }

    #[tokio::test]
    async fn discards_responses_with_nothing_outstanding() {
        let handler = handler();
        handler.on_response(ok_response("stray"));
        assert!(!handler.is_response_pending());

        // A later expectation sees only its own responses
        let future = handler.create_response_future(1, "NOOP").unwrap();
        handler.on_response(ok_response("mine"));
        let responses = future.await.unwrap().unwrap();
        assert_eq!(responses, vec![ok_response("mine")]);
    }

    #[tokio::test]
    async fn fails_on_exception() {
        let handler = handler();
        let future = handler.create_response_future(3, "MAIL RCPT DATA").unwrap();

        handler.on_exception(SessionError::ResponseTooLong);

        let err = future.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ResponseTooLong));

        // The slot is free again
        handler.create_response_future(1, "NOOP").unwrap();
    }

    #[tokio::test]
    async fn fails_when_the_channel_goes_inactive() {
        let handler = handler();
        let future = handler.create_response_future(1, "NOOP").unwrap();

        handler.on_channel_inactive();

        let err = future.await.unwrap().unwrap_err();
        match err {
            SessionError::ChannelClosed(message) => assert_eq!(
                message,
                "[connection#1] Handled channelInactive while waiting \
                 for a response to [NOOP]"
            ),
            other => panic!("expected ChannelClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inactivity_with_nothing_outstanding_is_a_no_op() {
        let handler = handler();
        handler.on_channel_inactive();
        handler.create_response_future(1, "NOOP").unwrap();
    }

    #[tokio::test]
    async fn new_expectations_after_each_terminal_event() {
        let handler = handler();

        let f = handler.create_response_future(1, "a").unwrap();
        handler.on_response(ok_response("OK"));
        f.await.unwrap().unwrap();

        let f = handler.create_response_future(2, "b").unwrap();
        handler.on_response(ok_response("OK"));
        handler.on_response(ok_response("OK"));
        f.await.unwrap().unwrap();

        let f = handler.create_response_future(1, "c").unwrap();
        handler.on_exception(SessionError::ResponseTooLong);
        f.await.unwrap().unwrap_err();

        handler.create_response_future(1, "d").unwrap();
    }

    #[tokio::test]
    async fn reports_whether_a_response_is_pending() {
        let handler = handler();
        assert!(!handler.is_response_pending());

        let _future = handler.create_response_future(1, "NOOP").unwrap();
        assert!(handler.is_response_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_no_response_arrives() {
        let impatient = Arc::new(ResponseHandler::new(
            "connection#1",
            Duration::from_millis(200),
        ));
        let future = impatient.create_response_future(1, "NOOP").unwrap();

        let started = tokio::time::Instant::now();
        let err = future.await.unwrap().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(500));

        match err {
            SessionError::ReadTimeout(message) => assert_eq!(
                message,
                "[connection#1] Timed out waiting for a response to [NOOP]"
            ),
            other => panic!("expected ReadTimeout, got {other:?}"),
        }

        // The slot is free again
        impatient.create_response_future(1, "NOOP").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_completed_expectation_does_not_time_out_later() {
        let impatient = Arc::new(ResponseHandler::new(
            "connection#1",
            Duration::from_millis(200),
        ));

        let future = impatient.create_response_future(1, "first").unwrap();
        impatient.on_response(ok_response("OK"));
        future.await.unwrap().unwrap();

        // A stale timer from the first expectation must not fire into
        // the second one
        let mut future = impatient.create_response_future(1, "second").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(future.try_recv().is_err());
        assert!(impatient.is_response_pending());
    }
}
