use std::collections::BTreeMap;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use crate::chunk::Chunk;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::shared_slice::SharedSlice;
use crate::status::{Status, StatusCode};

/// `Ok(None)` signals the end of the message
pub type PullResult = Result<Option<Bytes>, Status>;
/// `Ok(None)` signals that the read was closed before any message was bound to it
pub type PullAllResult = Result<Option<Vec<Bytes>>, Status>;

enum ReadMode {
    Idle,
    ReadSlice(oneshot::Sender<PullResult>),
    ReadAll {
        building: Vec<Bytes>,
        done: oneshot::Sender<PullAllResult>,
    },
    Closed(Status),
}

fn slice_len(slice: &SharedSlice) -> u64 {
    slice.len().safe_cast()
}

/// Reassembles one incoming message from chunks that may arrive out of order, duplicated or
///  overlapping, and hands out the bytes strictly in offset order.
pub struct Linearizer {
    /// bytes that may be buffered beyond the read offset
    max_buffer: u64,
    /// everything before this offset was handed to the consumer
    offset: u64,
    /// known once a chunk with end-of-message was seen
    length: Option<u64>,
    /// non-overlapping, all at or after `offset`
    pending_push: BTreeMap<u64, SharedSlice>,
    read_mode: ReadMode,
}

impl Linearizer {
    pub fn new(max_buffer: u64) -> Linearizer {
        Linearizer {
            max_buffer,
            offset: 0,
            length: None,
            pending_push: Default::default(),
            read_mode: ReadMode::Idle,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.read_mode, ReadMode::Closed(_))
    }

    fn is_closed_with_error(&self) -> bool {
        matches!(self.read_mode, ReadMode::Closed(ref status) if status.is_error())
    }

    /// Closes the message, returning the status it actually closed with. A clean close while
    ///  bytes are missing or unread turns into a cancellation, and closing an already closed
    ///  message returns the original status.
    pub fn close(&mut self, status: Status) -> Status {
        let status = if status.is_ok() {
            match self.length {
                _ if !self.pending_push.is_empty() => Status::cancelled("Gaps existed at close time"),
                None => Status::cancelled("Closed before end of message seen"),
                Some(length) if length != self.offset => Status::cancelled("Closed before end of message reached"),
                Some(_) => status,
            }
        }
        else {
            status
        };

        debug!("closing incoming message: {}", status);
        match std::mem::replace(&mut self.read_mode, ReadMode::Closed(status.clone())) {
            ReadMode::Closed(previous) => {
                self.read_mode = ReadMode::Closed(previous.clone());
                previous
            }
            ReadMode::Idle => {
                self.pending_push.clear();
                status
            }
            ReadMode::ReadSlice(done) => {
                self.pending_push.clear();
                let _ = done.send(if status.is_ok() { Ok(None) } else { Err(status.clone()) });
                status
            }
            ReadMode::ReadAll { building, done } => {
                self.pending_push.clear();
                let _ = done.send(if status.is_ok() { Ok(Some(building)) } else { Err(status.clone()) });
                status
            }
        }
    }

    fn close_if_complete(&mut self) {
        if self.length == Some(self.offset) {
            self.close(Status::ok());
        }
    }

    /// Returns `false` if the chunk was rejected, either because it is beyond the buffering
    ///  limit or because the message is broken
    pub fn push(&mut self, mut chunk: Chunk) -> bool {
        let chunk_start = chunk.offset;
        let chunk_end = chunk.end();
        trace!("push {}..{} end-of-message={} offset={}", chunk_start, chunk_end, chunk.end_of_message, self.offset);

        if chunk_start > self.offset && chunk_end > self.offset.saturating_add(self.max_buffer) {
            debug!("rejecting chunk {}..{}: past end of buffering window of {} bytes", chunk_start, chunk_end, self.max_buffer);
            return false;
        }

        if let Some(length) = self.length {
            if chunk_end > length {
                self.close(Status::invalid_argument("Received chunk past end of message"));
            }
            else if chunk.end_of_message && length != chunk_end {
                self.close(Status::invalid_argument("Received ambiguous end of message point"));
            }
        }
        else if chunk.end_of_message {
            if self.offset > chunk_end {
                self.close(Status::invalid_argument("Already read past end of message"));
            }
            let pending_end = self.pending_push.last_key_value()
                .map(|(&start, slice)| start + slice_len(slice));
            if pending_end.is_some_and(|end| end > chunk_end) {
                self.close(Status::invalid_argument("Already received bytes past end of message"));
            }
            self.length = Some(chunk_end);
            self.close_if_complete();
        }

        if let ReadMode::Closed(ref status) = self.read_mode {
            trace!("push to closed message");
            return status.is_ok();
        }

        if chunk_end == chunk_start {
            return true;
        }

        let next_pending_start = self.pending_push.first_key_value()
            .map(|(&start, _)| start);
        if chunk_start == self.offset && next_pending_start.map_or(true, |start| start > chunk_end) {
            if let Some(done) = self.take_read_slice() {
                trace!("fast path");
                self.offset = chunk_end;
                self.close_if_complete();
                let _ = done.send(Ok(Some(chunk.slice.to_bytes())));
                return true;
            }
        }

        if chunk_start < self.offset {
            if chunk_end <= self.offset {
                trace!("chunk was consumed already");
                return true;
            }
            chunk.trim_begin_to(self.offset);
        }

        if self.pending_push.is_empty() {
            self.pending_push.insert(chunk.offset, chunk.slice);
        }
        else {
            self.integrate(chunk);
        }

        if let Some(done) = self.take_read_slice() {
            self.pull(done);
        }
        else if matches!(self.read_mode, ReadMode::ReadAll { .. }) {
            self.continue_read_all();
        }

        !self.is_closed_with_error()
    }

    fn mismatch(&mut self) {
        self.close(Status::data_loss("Linearizer received different bytes for the same span"));
    }

    /// Adds a chunk to `pending_push`, trimming or splitting it where it overlaps with chunks
    ///  that are there already. Overlapping bytes must be identical.
    fn integrate(&mut self, mut chunk: Chunk) {
        if self.is_closed() {
            return;
        }

        if let Some(existing) = self.pending_push.get(&chunk.offset) {
            let existing_len = existing.len();
            let common_length = chunk.slice.len().min(existing_len);
            let skip_to = chunk.offset + slice_len(existing);
            let is_same = chunk.slice.as_ref()[..common_length] == existing.as_ref()[..common_length];

            if !is_same {
                self.mismatch();
            }
            else if chunk.slice.len() > existing_len {
                chunk.trim_begin_to(skip_to);
                self.integrate(chunk);
            }
            return;
        }

        if let Some((&before_start, before)) = self.pending_push.range(..chunk.offset).next_back() {
            let before_end = before_start + slice_len(before);
            if before_end > chunk.offset {
                let common_length: usize = (before_end - chunk.offset).min(chunk.len()).prechecked_cast();
                let skip: usize = (chunk.offset - before_start).prechecked_cast();
                let is_same = before.as_ref()[skip..skip + common_length] == chunk.slice.as_ref()[..common_length];

                if !is_same {
                    self.mismatch();
                }
                else if before_end < chunk.end() {
                    chunk.trim_begin_to(before_end);
                    self.integrate(chunk);
                }
                return;
            }
        }

        if let Some((&after_start, after)) = self.pending_push.range(chunk.offset..).next() {
            if after_start < chunk.end() {
                let after_end = after_start + slice_len(after);
                let common_length: usize = (chunk.end() - after_start).min(slice_len(after)).prechecked_cast();
                let skip: usize = (after_start - chunk.offset).prechecked_cast();
                let is_same = after.as_ref()[..common_length] == chunk.slice.as_ref()[skip..skip + common_length];

                if !is_same {
                    self.mismatch();
                    return;
                }
                if after_end < chunk.end() {
                    let mut tail = chunk.clone();
                    chunk.trim_end_to(after_start);
                    tail.trim_begin_to(after_end);
                    self.integrate(chunk);
                    self.integrate(tail);
                    return;
                }
                chunk.trim_end_to(after_start);
            }
        }

        self.pending_push.insert(chunk.offset, chunk.slice);
    }

    fn take_read_slice(&mut self) -> Option<oneshot::Sender<PullResult>> {
        if !matches!(self.read_mode, ReadMode::ReadSlice(_)) {
            return None;
        }
        match std::mem::replace(&mut self.read_mode, ReadMode::Idle) {
            ReadMode::ReadSlice(done) => Some(done),
            _ => None,
        }
    }

    fn read_in_progress() -> Status {
        Status::new(StatusCode::FailedPrecondition, "a read is already in progress")
    }

    /// Hands out the next contiguous slice, or stores `done` until one arrives
    pub fn pull(&mut self, done: oneshot::Sender<PullResult>) {
        match self.read_mode {
            ReadMode::Closed(ref status) => {
                let _ = done.send(if status.is_ok() { Ok(None) } else { Err(status.clone()) });
            }
            ReadMode::ReadSlice(_) | ReadMode::ReadAll { .. } => {
                let _ = done.send(Err(Self::read_in_progress()));
            }
            ReadMode::Idle => {
                if let Some(entry) = self.pending_push.first_entry() {
                    if *entry.key() == self.offset {
                        let slice = entry.remove();
                        self.offset += slice_len(&slice);
                        self.close_if_complete();
                        let _ = done.send(Ok(Some(slice.to_bytes())));
                        return;
                    }
                }
                self.read_mode = ReadMode::ReadSlice(done);
            }
        }
    }

    /// Collects all remaining slices, completing once the message is complete
    pub fn pull_all(&mut self, done: oneshot::Sender<PullAllResult>) {
        match self.read_mode {
            ReadMode::Closed(ref status) => {
                let _ = done.send(if status.is_ok() { Ok(Some(Vec::new())) } else { Err(status.clone()) });
            }
            ReadMode::ReadSlice(_) | ReadMode::ReadAll { .. } => {
                let _ = done.send(Err(Self::read_in_progress()));
            }
            ReadMode::Idle => {
                self.read_mode = ReadMode::ReadAll { building: Vec::new(), done };
                self.continue_read_all();
            }
        }
    }

    fn continue_read_all(&mut self) {
        loop {
            let ReadMode::ReadAll { building, .. } = &mut self.read_mode else {
                return;
            };
            match self.pending_push.first_entry() {
                Some(entry) if *entry.key() == self.offset => {
                    let slice = entry.remove();
                    self.offset += slice_len(&slice);
                    building.push(slice.to_bytes());
                }
                _ => return,
            }
            if self.length == Some(self.offset) {
                self.close(Status::ok());
                return;
            }
        }
    }
}
