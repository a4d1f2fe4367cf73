//! Request assembly state machine.
//!
//! One [`RequestAssembler`] follows a single logical request through
//!
//! ```text
//! AwaitBegin -> ReadingParams -> ReadingStdin -> Handling
//!            -> WritingStdout -> WritingEndRequest -> Done
//! ```
//!
//! It is driven by three events: a record arrived ([`RequestAssembler::on_record`]),
//! the handler finished ([`RequestAssembler::on_response`]) and a marked
//! outbound frame was fully written ([`RequestAssembler::on_flushed`]).
//! It never touches the socket; the connection owns all I/O.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{FcgiError, Result};
use crate::handler::{Completion, LogicalRequest};
use crate::record::{Record, RecordType};
use crate::records::{
    decode_name_values_partial, encode_stream_into, BeginRequest, EndRequest, ProtocolStatus, Role,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitBegin,
    ReadingParams,
    ReadingStdin,
    Handling,
    WritingStdout,
    WritingEndRequest,
    Done,
}

/// Size limits for request streams.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_params_bytes: usize,
    pub max_stdin_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_params_bytes: 1_048_576, // 1 MiB
            max_stdin_bytes: 33_554_432, // 32 MiB
        }
    }
}

/// Progress points reported back by the connection once a frame is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// Output streams including their terminators were written.
    StdoutFlushed,
    /// END_REQUEST was written.
    EndRequestFlushed,
}

/// Encoded record bytes queued for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub data: Bytes,
    pub milestone: Option<Milestone>,
}

impl OutboundFrame {
    pub fn plain(data: Bytes) -> Self {
        Self {
            data,
            milestone: None,
        }
    }
}

/// What the connection must do after a record was applied.
#[derive(Debug)]
pub enum Step {
    Continue,
    Dispatch(LogicalRequest),
    Reply(Vec<OutboundFrame>),
}

#[derive(Debug)]
pub struct RequestAssembler {
    state: State,
    limits: RequestLimits,
    begin: Option<BeginRequest>,
    params: HashMap<String, String>,
    params_bytes: usize,
    params_carry: BytesMut,
    stdin: BytesMut,
    // Set when we answered before the gateway finished sending (abort, rejected role).
    ended_early: bool,
    // Id of a previous request on this connection that was answered early;
    // its remaining stream records are dropped.
    ignored_id: Option<u16>,
    abandoned: bool,
}

impl Default for RequestAssembler {
    fn default() -> Self {
        Self::new(RequestLimits::default())
    }
}

impl RequestAssembler {
    pub fn new(limits: RequestLimits) -> Self {
        Self {
            state: State::AwaitBegin,
            limits,
            begin: None,
            params: HashMap::new(),
            params_bytes: 0,
            params_carry: BytesMut::new(),
            stdin: BytesMut::new(),
            ended_early: false,
            ignored_id: None,
            abandoned: false,
        }
    }

    /// Fresh assembler for the next request on a kept connection. Trailing
    /// records of `previous` are dropped when it was answered early.
    pub fn next_request(limits: RequestLimits, previous: &RequestAssembler) -> Self {
        Self {
            ignored_id: previous.ended_early_id(),
            ..Self::new(limits)
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub fn request_id(&self) -> Option<u16> {
        self.begin.map(|b| b.request_id)
    }

    pub fn keep_conn(&self) -> bool {
        self.begin.is_some_and(|b| b.keep_conn())
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// The request id when the request was answered before its input ended.
    pub fn ended_early_id(&self) -> Option<u16> {
        self.request_id().filter(|_| self.ended_early)
    }

    /// Apply one request record (request id != 0). Records arrive in wire order.
    pub fn on_record(&mut self, record: Record) -> Result<Step> {
        if self.abandoned || record.is_management() || self.state == State::Done {
            return Err(self.unexpected(&record));
        }

        let Some(begin) = self.begin else {
            return self.on_begin(record);
        };

        if record.request_id() != begin.request_id {
            if record.kind() == Some(RecordType::BeginRequest) {
                // One request at a time per connection.
                debug!(
                    active = begin.request_id,
                    rejected = record.request_id(),
                    "rejecting multiplexed request"
                );
                return Ok(Step::Reply(vec![OutboundFrame::plain(
                    EndRequest {
                        request_id: record.request_id(),
                        app_status: 0,
                        protocol_status: ProtocolStatus::CantMpxConn,
                    }
                    .encode(),
                )]));
            }
            return Err(self.unexpected(&record));
        }

        match (self.state, record.kind()) {
            (
                State::ReadingParams | State::ReadingStdin | State::Handling,
                Some(RecordType::AbortRequest),
            ) => Ok(self.abort(begin.request_id)),
            (State::ReadingParams, Some(RecordType::Params)) => {
                self.on_params(&record)?;
                Ok(Step::Continue)
            }
            (State::ReadingStdin, Some(RecordType::Stdin)) => self.on_stdin(&record, begin),
            (State::WritingStdout | State::WritingEndRequest, Some(RecordType::AbortRequest)) => {
                Ok(Step::Continue)
            }
            (State::WritingStdout | State::WritingEndRequest, _)
                if self.ended_early && is_trailing_input(&record) =>
            {
                Ok(Step::Continue)
            }
            _ => Err(self.unexpected(&record)),
        }
    }

    fn on_begin(&mut self, record: Record) -> Result<Step> {
        if record.kind() != Some(RecordType::BeginRequest) {
            if self.ignored_id == Some(record.request_id()) && is_trailing_input(&record) {
                return Ok(Step::Continue);
            }
            return Err(self.unexpected(&record));
        }
        self.ignored_id = None;
        let begin = BeginRequest::decode(&record)?;
        self.begin = Some(begin);
        match begin.role {
            Role::Responder | Role::Authorizer => {
                debug!(request_id = begin.request_id, role = ?begin.role, "request started");
                self.state = State::ReadingParams;
                Ok(Step::Continue)
            }
            Role::Filter | Role::Unknown(_) => {
                debug!(request_id = begin.request_id, role = ?begin.role, "unsupported role");
                self.ended_early = true;
                self.state = State::WritingEndRequest;
                Ok(Step::Reply(vec![self.end_request_frame(
                    begin.request_id,
                    0,
                    ProtocolStatus::UnknownRole,
                )]))
            }
        }
    }

    fn on_params(&mut self, record: &Record) -> Result<()> {
        if record.is_stream_end() {
            if !self.params_carry.is_empty() {
                return Err(FcgiError::MalformedRecord {
                    record: "PARAMS",
                    reason: "truncated name-value pair",
                });
            }
            self.params_carry = BytesMut::new();
            self.state = State::ReadingStdin;
            return Ok(());
        }

        self.params_bytes = self.params_bytes.saturating_add(record.content.len());
        if self.params_bytes > self.limits.max_params_bytes {
            return Err(FcgiError::ParamsTooLarge(self.limits.max_params_bytes));
        }

        // A pair may straddle two records; keep the unfinished tail.
        self.params_carry.extend_from_slice(&record.content);
        let (pairs, consumed) = decode_name_values_partial(&self.params_carry)?;
        self.params_carry.advance(consumed);
        self.params.extend(pairs);
        Ok(())
    }

    fn on_stdin(&mut self, record: &Record, begin: BeginRequest) -> Result<Step> {
        if !record.is_stream_end() {
            if self.stdin.len() + record.content.len() > self.limits.max_stdin_bytes {
                return Err(FcgiError::StdinTooLarge(self.limits.max_stdin_bytes));
            }
            self.stdin.extend_from_slice(&record.content);
            return Ok(Step::Continue);
        }

        self.state = State::Handling;
        let request = LogicalRequest {
            request_id: begin.request_id,
            role: begin.role,
            keep_conn: begin.keep_conn(),
            params: std::mem::take(&mut self.params),
            stdin: std::mem::take(&mut self.stdin).freeze(),
        };
        debug!(
            request_id = begin.request_id,
            params = request.params.len(),
            stdin_bytes = request.stdin.len(),
            "request assembled"
        );
        Ok(Step::Dispatch(request))
    }

    fn abort(&mut self, request_id: u16) -> Step {
        debug!(request_id, state = ?self.state, "request aborted by gateway");
        self.params.clear();
        self.params_carry = BytesMut::new();
        self.stdin = BytesMut::new();
        self.ended_early = true;
        self.state = State::WritingEndRequest;
        Step::Reply(vec![self.end_request_frame(
            request_id,
            0,
            ProtocolStatus::RequestComplete,
        )])
    }

    /// Turn the handler's result into the response record sequence.
    ///
    /// Returns `None` when the result is stale: the request was aborted, the
    /// connection failed, or the id does not match the request being handled.
    pub fn on_response(&mut self, completion: Completion) -> Option<Vec<OutboundFrame>> {
        let request_id = self.request_id()?;
        if self.abandoned || self.state != State::Handling || completion.request_id != request_id
        {
            debug!(
                request_id = completion.request_id,
                state = ?self.state,
                "discarding stale handler result"
            );
            return None;
        }

        let envelope = completion.result.unwrap_or_else(|e| {
            debug!(request_id, error = %e, "handler failed");
            e.into_envelope()
        });

        let mut streams = BytesMut::new();
        encode_stream_into(&mut streams, RecordType::Stdout, request_id, &envelope.stdout);
        if !envelope.stderr.is_empty() {
            encode_stream_into(&mut streams, RecordType::Stderr, request_id, &envelope.stderr);
        }

        self.state = State::WritingStdout;
        Some(vec![
            OutboundFrame {
                data: streams.freeze(),
                milestone: Some(Milestone::StdoutFlushed),
            },
            self.end_request_frame(
                request_id,
                envelope.app_status,
                ProtocolStatus::RequestComplete,
            ),
        ])
    }

    /// Advance output states once the connection has written a marked frame.
    pub fn on_flushed(&mut self, milestone: Milestone) {
        self.state = match (self.state, milestone) {
            (State::WritingStdout, Milestone::StdoutFlushed) => State::WritingEndRequest,
            (State::WritingEndRequest, Milestone::EndRequestFlushed) => {
                debug!(request_id = ?self.request_id(), "request complete");
                State::Done
            }
            (state, _) => state,
        };
    }

    /// The connection is gone: drop everything and refuse any later result.
    pub fn abandon(&mut self) {
        if !self.abandoned && self.state != State::Done {
            debug!(request_id = ?self.request_id(), state = ?self.state, "request abandoned");
        }
        self.abandoned = true;
        self.params.clear();
        self.params_carry = BytesMut::new();
        self.stdin = BytesMut::new();
    }

    fn end_request_frame(
        &self,
        request_id: u16,
        app_status: u32,
        protocol_status: ProtocolStatus,
    ) -> OutboundFrame {
        OutboundFrame {
            data: EndRequest {
                request_id,
                app_status,
                protocol_status,
            }
            .encode(),
            milestone: Some(Milestone::EndRequestFlushed),
        }
    }

    fn unexpected(&self, record: &Record) -> FcgiError {
        FcgiError::UnexpectedRecord {
            state: self.state,
            record_type: record.header.record_type,
            request_id: record.request_id(),
        }
    }
}

/// Input a gateway may still send for a request we already ended.
fn is_trailing_input(record: &Record) -> bool {
    matches!(
        record.kind(),
        Some(RecordType::Params | RecordType::Stdin | RecordType::Data | RecordType::AbortRequest)
    )
}
