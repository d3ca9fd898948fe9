use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use crate::receive_mode::Waiter;
use crate::status::Status;
use crate::stream::send::OutstandingRequest;
use crate::stream::StreamCore;
use crate::transport::SendPriority;

/// The local side's progress in closing its sending direction
#[derive(Debug)]
pub(super) enum LocalClose {
    Open,
    /// close was requested, the end of stream waits for queued chunks to be sent
    Draining(Status),
    EndSent {
        status: Status,
        retries: u32,
        in_flight: bool,
    },
    /// the transport acknowledged the end of stream
    Acked {
        status: Status,
        ack: Status,
    },
}

#[derive(Debug)]
pub(super) enum RemoteClose {
    Open,
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Phase {
    Active,
    /// waiting for the transport to flush and close
    ClosingProtocol,
    Quiesced,
}

impl StreamCore {
    pub(super) fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    pub(super) fn is_accepting_new_sends(&self) -> bool {
        self.is_active() && self.forced.is_none() && matches!(self.local, LocalClose::Open)
    }

    /// Queued chunks are still sent after a clean close request, until the end of stream goes out
    pub(super) fn is_open_for_sending(&self) -> bool {
        if !self.is_active() || self.forced.is_some() {
            return false;
        }
        match &self.local {
            LocalClose::Open => true,
            LocalClose::Draining(status) => status.is_ok(),
            LocalClose::EndSent { .. } | LocalClose::Acked { .. } => false,
        }
    }

    pub(super) fn stream_end_status(&self) -> Option<Status> {
        match &self.local {
            LocalClose::Draining(status) | LocalClose::EndSent { status, .. } => Some(status.clone()),
            _ => None,
        }
    }

    /// Requests closing the stream. `done` is notified once the stream is torn down completely.
    pub(super) fn close(&mut self, status: Status, done: oneshot::Sender<()>) {
        if self.phase == Phase::Quiesced {
            let _ = done.send(());
            return;
        }
        self.close_waiters.push(done);

        if !self.is_active() || !matches!(self.local, LocalClose::Open) {
            debug!("stream is closing already");
            return;
        }

        debug!("closing stream: {}", status);
        self.stop_reading(status.clone());
        let is_error = status.is_error();
        self.local = LocalClose::Draining(status);
        if is_error {
            self.stop_sending();
        }
        self.maybe_send_stream_end();
    }

    /// The end of stream carries the first message id that was never used, so it goes out only
    ///  after everything queued before it
    pub(super) fn maybe_send_stream_end(&mut self) {
        if !self.is_active() {
            return;
        }
        let status = match &self.local {
            LocalClose::Draining(status) => status.clone(),
            _ => return,
        };
        if status.is_ok() && (!self.send_queue.is_empty() || self.has_outstanding_chunks()) {
            trace!("end of stream waits for {} queued chunks", self.send_queue.len());
            return;
        }

        self.local = LocalClose::EndSent {
            status,
            retries: 0,
            in_flight: true,
        };
        self.request_stream_end();
    }

    fn request_stream_end(&mut self) {
        debug!("sending end of stream at message {}", self.next_message_id);
        self.issue_request(OutstandingRequest::StreamEnd, SendPriority::Control);
    }

    pub(super) fn on_stream_end_ack(&mut self, ack_status: Status) {
        let LocalClose::EndSent { status, retries, in_flight } = &mut self.local else {
            warn!("unexpected acknowledgement for end of stream");
            return;
        };
        *in_flight = false;
        let status = status.clone();

        let may_retry = ack_status.is_retryable()
            && *retries < self.config.max_close_retries
            && self.forced.is_none()
            && self.phase == Phase::Active;
        if may_retry {
            *retries += 1;
            *in_flight = true;
            debug!("retrying end of stream ({} of {}): {}", retries, self.config.max_close_retries, ack_status);
            self.request_stream_end();
            return;
        }

        debug!("end of stream acknowledged: {}", ack_status);
        self.local = LocalClose::Acked { status, ack: ack_status };
        self.maybe_begin_closing_protocol();
    }

    pub(super) fn on_stream_end_received(&mut self, message_id: u64, status: Status) {
        if !matches!(self.remote, RemoteClose::Open) {
            trace!("peer closed the stream already");
            return;
        }
        if status.is_error() {
            self.on_remote_closed(status);
            return;
        }

        debug!("peer ends the stream at message {}", message_id);
        let ready = self.receive_mode.begin(message_id, Waiter::StreamEnd);
        self.on_ready(ready);
    }

    pub(super) fn on_remote_closed(&mut self, status: Status) {
        if !matches!(self.remote, RemoteClose::Open) {
            return;
        }
        self.remote = RemoteClose::Closed;

        if status.is_error() {
            self.force_close(status);
            return;
        }
        debug!("peer closed the stream");
        self.stop_reading(Status::cancelled("stream was closed by peer"));
        self.maybe_begin_closing_protocol();
    }

    /// Closes without a handshake, e.g. because the peer went away or closed with an error
    pub(super) fn force_close(&mut self, status: Status) {
        if !self.is_active() || self.forced.is_some() {
            return;
        }
        debug!("force closing stream: {}", status);
        self.forced = Some(status.clone());
        self.remote = RemoteClose::Closed;

        // an end of stream in flight is waited for, its acknowledgement continues from here
        let is_waiting_for_ack = matches!(self.local, LocalClose::EndSent { in_flight: true, .. } | LocalClose::Acked { .. });
        if !is_waiting_for_ack {
            self.local = LocalClose::Acked { status: status.clone(), ack: status.clone() };
        }

        self.stop_reading(status);
        self.stop_sending();
        self.maybe_begin_closing_protocol();
    }

    fn maybe_begin_closing_protocol(&mut self) {
        if !self.is_active() {
            return;
        }
        let LocalClose::Acked { status, ack } = &self.local else {
            return;
        };
        // after an error, the peer closes without sending an end of stream of its own
        let is_remote_closed = matches!(self.remote, RemoteClose::Closed);
        if status.is_error() || ack.is_error() || is_remote_closed {
            self.begin_closing_protocol();
        }
    }

    fn begin_closing_protocol(&mut self) {
        debug!("both directions are closed: closing transport");
        self.phase = Phase::ClosingProtocol;
        self.stop_reading(Status::cancelled("stream is closing"));
        self.transport.close();
    }

    pub(super) fn transport_closed(&mut self) {
        match self.phase {
            Phase::Quiesced => {
                warn!("transport reported closing twice");
                return;
            }
            Phase::Active => {
                warn!("transport closed while the stream was active");
                self.phase = Phase::ClosingProtocol;
            }
            Phase::ClosingProtocol => {}
        }

        if let Err(e) = self.registry.unregister(self.peer, self.stream_id) {
            error!("{}", e);
        }

        let status = self.forced.clone()
            .unwrap_or_else(|| Status::cancelled("stream was closed"));
        self.stop_sending();
        self.requests.clear();
        self.unframed_chunk_request = None;
        self.stop_reading(status.clone());
        self.discard_receive_state(&status);

        self.phase = Phase::Quiesced;
        debug!("stream quiesced");
        for done in self.close_waiters.drain(..) {
            let _ = done.send(());
        }
    }
}
