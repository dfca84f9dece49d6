use crate::alerts::Priority;
use crate::error::NotifyError;
use crate::monitoring::PipelineTelemetry;
use crate::notify::{NotificationRequest, Notifier};
use crate::rate_limiter::RateLimiter;
use crate::remediation::ApprovalRequest;
use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MAX_TITLE_BYTES: usize = 256;
const MAX_BODY_BYTES: usize = 1024;

#[derive(Debug)]
struct ThrottleState {
    limiter: RateLimiter,
    queue: VecDeque<NotificationRequest>,
}

/// Rate-limits another notifier
///
/// Notifications over the per-minute budget wait in a bounded queue (oldest
/// dropped first) and go out on the next `notify` or `flush` once capacity
/// frees up. P1 notifications and approval requests are never held back.
pub struct ThrottledNotifier {
    inner: Arc<dyn Notifier>,
    state: Mutex<ThrottleState>,
    max_queue_size: usize,
    telemetry: Option<Arc<PipelineTelemetry>>,
}

impl ThrottledNotifier {
    /// # Arguments
    ///
    /// * `inner` - Notifier that actually delivers messages
    /// * `max_per_minute` - Maximum number of notifications per minute
    pub fn new(inner: Arc<dyn Notifier>, max_per_minute: usize) -> Self {
        Self::with_queue_size(inner, max_per_minute, 100)
    }

    pub fn with_queue_size(
        inner: Arc<dyn Notifier>,
        max_per_minute: usize,
        max_queue_size: usize,
    ) -> Self {
        Self {
            inner,
            state: Mutex::new(ThrottleState {
                limiter: RateLimiter::per_minute(max_per_minute),
                queue: VecDeque::new(),
            }),
            max_queue_size: max_queue_size.max(1),
            telemetry: None,
        }
    }

    pub fn with_monitoring(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    fn deliver(&self, state: &mut ThrottleState, request: &NotificationRequest) -> Result<(), NotifyError> {
        let mut trimmed = request.clone();
        trimmed.title = truncate_text(&request.title, MAX_TITLE_BYTES);
        trimmed.body = truncate_text(&request.body, MAX_BODY_BYTES);

        let result = self.inner.notify(&trimmed);
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_notification_result(result.is_ok());
        }
        match &result {
            Ok(()) => state.limiter.record(),
            Err(e) => error!("Failed to send notification '{}': {}", request.title, e),
        }
        result
    }

    fn drain(&self, state: &mut ThrottleState) -> Result<usize, NotifyError> {
        let mut sent = 0;
        while !state.queue.is_empty() && state.limiter.can_acquire() {
            if let Some(queued) = state.queue.pop_front() {
                self.deliver(state, &queued)?;
                sent += 1;
            }
        }
        if sent > 0 {
            info!("Sent {} queued notification(s)", sent);
        }
        Ok(sent)
    }
}

impl Notifier for ThrottledNotifier {
    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let mut state = self.state.lock().unwrap();

        // A failing queued message must not block the new one
        if let Err(e) = self.drain(&mut state) {
            warn!("Queued notification failed: {}", e);
        }

        if request.priority == Priority::P1 || state.limiter.can_acquire() {
            return self.deliver(&mut state, request);
        }

        if state.queue.len() >= self.max_queue_size {
            if let Some(dropped) = state.queue.pop_front() {
                warn!(
                    "Notification queue full, dropping oldest notification: {}",
                    dropped.title
                );
            }
        }
        info!("Queued notification due to rate limit: {}", request.title);
        state.queue.push_back(request.clone());
        Ok(())
    }

    fn request_approval(&self, request: &ApprovalRequest) -> Result<(), NotifyError> {
        self.inner.request_approval(request)
    }

    fn flush(&self) -> Result<usize, NotifyError> {
        let mut state = self.state.lock().unwrap();
        let sent = self.drain(&mut state)?;
        drop(state);
        Ok(sent + self.inner.flush()?)
    }
}

/// Truncate text to at most `max_length` bytes, ending with "..."
///
/// Cuts on a UTF-8 character boundary.
pub(crate) fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }

    let mut truncate_at = max_length.saturating_sub(3);
    while truncate_at > 0 && !text.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    format!("{}...", &text[..truncate_at])
}
