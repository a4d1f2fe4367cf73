//! Per-socket I/O driver.
//!
//! A [`Connection`] owns one transport, one [`FrameReassembler`] and one
//! [`RequestAssembler`]. The reactor calls it back on readiness; it never
//! blocks and never assumes a read or write moves more bytes than the
//! transport accepted.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::assembler::{OutboundFrame, RequestAssembler, RequestLimits, State, Step};
use crate::error::{FcgiError, Result};
use crate::handler::{Completion, CompletionSender, LogicalRequest, RequestHandler, Responder};
use crate::reassembler::{FrameReassembler, DEFAULT_MAX_BUFFERED_BYTES};
use crate::record::{Record, RecordType};
use crate::records::{GetValues, UnknownType, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS};

pub const DEFAULT_READ_CHUNK_BYTES: usize = 4096;

/// Non-blocking byte stream.
///
/// `try_read` returns `Ok(0)` on orderly close and `WouldBlock` when nothing
/// is available; `try_write` may accept fewer bytes than offered.
pub trait Transport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Readiness registration for one socket.
pub trait Reactor {
    fn register_read(&mut self);
    fn register_write(&mut self);
    fn unregister_write(&mut self);
    /// Drop every registration for the socket.
    fn deregister(&mut self);
}

/// Callbacks a reactor delivers to a registered socket owner.
pub trait ReadinessHandler {
    fn on_readable(&mut self, reactor: &mut dyn Reactor);
    fn on_writable(&mut self, reactor: &mut dyn Reactor);
    fn on_error(&mut self, reactor: &mut dyn Reactor, error: FcgiError);
}

/// Values advertised in GET_VALUES_RESULT.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub max_conns: usize,
    pub max_reqs: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_conns: 64,
            max_reqs: 64,
        }
    }
}

impl Capabilities {
    pub fn lookup(&self, name: &str) -> Option<String> {
        match name {
            FCGI_MAX_CONNS => Some(self.max_conns.to_string()),
            FCGI_MAX_REQS => Some(self.max_reqs.to_string()),
            FCGI_MPXS_CONNS => Some("0".to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub read_chunk_bytes: usize,
    pub max_buffered_bytes: usize,
    pub max_requests_per_connection: usize,
    pub request_limits: RequestLimits,
    pub capabilities: Capabilities,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            max_requests_per_connection: 64,
            request_limits: RequestLimits::default(),
            capabilities: Capabilities::default(),
        }
    }
}

pub struct Connection<T> {
    id: u64,
    transport: Option<T>,
    reassembler: FrameReassembler,
    assembler: RequestAssembler,
    outbound: VecDeque<OutboundFrame>,
    handler: Arc<dyn RequestHandler>,
    completions: CompletionSender,
    config: ConnectionConfig,
    read_buf: Vec<u8>,
    write_registered: bool,
    completed_requests: usize,
    failure: Option<FcgiError>,
}

impl<T: Transport> Connection<T> {
    pub fn new(
        id: u64,
        transport: T,
        handler: Arc<dyn RequestHandler>,
        completions: CompletionSender,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            id,
            transport: Some(transport),
            reassembler: FrameReassembler::new(config.max_buffered_bytes),
            assembler: RequestAssembler::new(config.request_limits),
            outbound: VecDeque::new(),
            handler,
            completions,
            config,
            read_buf: vec![0u8; config.read_chunk_bytes.max(1)],
            write_registered: false,
            completed_requests: 0,
            failure: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start(&mut self, reactor: &mut dyn Reactor) {
        if self.transport.is_some() {
            reactor.register_read();
        }
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    pub fn state(&self) -> State {
        self.assembler.state()
    }

    pub fn completed_requests(&self) -> usize {
        self.completed_requests
    }

    /// The error that closed the connection, unless it was an orderly peer close.
    pub fn take_failure(&mut self) -> Option<FcgiError> {
        self.failure.take()
    }

    /// A handler result arrived through the completion queue.
    pub fn on_completion(&mut self, reactor: &mut dyn Reactor, completion: Completion) {
        if self.is_closed() {
            debug!(
                conn = self.id,
                request_id = completion.request_id,
                "connection closed; discarding handler result"
            );
            return;
        }
        if let Some(frames) = self.assembler.on_response(completion) {
            self.enqueue(reactor, frames);
        }
    }

    fn process_frames(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        while !self.is_closed() && !self.assembler.is_done() {
            let Some(record) = self.reassembler.poll_frame()? else {
                break;
            };
            trace!(
                conn = self.id,
                record_type = record.header.record_type,
                request_id = record.request_id(),
                content_length = record.header.content_length,
                "record received"
            );
            if record.is_management() {
                let reply = self.answer_management(&record)?;
                self.enqueue(reactor, vec![OutboundFrame::plain(reply)]);
                continue;
            }
            match self.assembler.on_record(record)? {
                Step::Continue => {}
                Step::Dispatch(request) => self.dispatch(request),
                Step::Reply(frames) => self.enqueue(reactor, frames),
            }
        }
        Ok(())
    }

    fn answer_management(&self, record: &Record) -> Result<Bytes> {
        match record.kind() {
            Some(RecordType::GetValues) => {
                let query = GetValues::decode(record)?;
                debug!(conn = self.id, names = ?query.names, "answering GET_VALUES");
                let capabilities = self.config.capabilities;
                query.resolve(|name| capabilities.lookup(name)).encode()
            }
            _ => Ok(UnknownType {
                record_type: record.header.record_type,
            }
            .encode()),
        }
    }

    fn dispatch(&mut self, request: LogicalRequest) {
        let responder = Responder::new(request.request_id, self.completions.clone());
        self.handler.handle(request, responder);
    }

    fn enqueue(&mut self, reactor: &mut dyn Reactor, frames: Vec<OutboundFrame>) {
        self.outbound.extend(frames);
        if !self.write_registered && !self.outbound.is_empty() {
            reactor.register_write();
            self.write_registered = true;
        }
    }

    fn finish_request(&mut self, reactor: &mut dyn Reactor) {
        self.completed_requests += 1;
        if !self.assembler.keep_conn()
            || self.completed_requests >= self.config.max_requests_per_connection
        {
            debug!(conn = self.id, requests = self.completed_requests, "closing connection");
            self.close(reactor);
            return;
        }

        self.assembler = RequestAssembler::next_request(self.config.request_limits, &self.assembler);
        // The gateway may already have sent the next request.
        if let Err(e) = self.process_frames(reactor) {
            self.on_error(reactor, e);
        }
    }

    fn close(&mut self, reactor: &mut dyn Reactor) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        reactor.deregister();
        drop(transport);
        self.write_registered = false;
        self.assembler.abandon();
        self.reassembler.clear();
        self.outbound.clear();
    }
}

impl<T: Transport> ReadinessHandler for Connection<T> {
    fn on_readable(&mut self, reactor: &mut dyn Reactor) {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            match transport.try_read(&mut self.read_buf) {
                Ok(0) => return self.on_error(reactor, FcgiError::ConnectionClosed),
                Ok(n) => {
                    if let Err(e) = self.reassembler.feed(&self.read_buf[..n]) {
                        return self.on_error(reactor, e);
                    }
                    if let Err(e) = self.process_frames(reactor) {
                        return self.on_error(reactor, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.on_error(reactor, e.into()),
            }
        }
    }

    fn on_writable(&mut self, reactor: &mut dyn Reactor) {
        while let Some(front) = self.outbound.front_mut() {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            match transport.try_write(&front.data) {
                Ok(0) => {
                    return self.on_error(reactor, io::Error::from(io::ErrorKind::WriteZero).into())
                }
                Ok(n) => {
                    // Short writes are normal; the remainder goes out next time.
                    front.data.advance(n);
                    if front.data.is_empty() {
                        let milestone = front.milestone;
                        self.outbound.pop_front();
                        if let Some(milestone) = milestone {
                            self.assembler.on_flushed(milestone);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.on_error(reactor, e.into()),
            }
        }

        if self.write_registered {
            reactor.unregister_write();
            self.write_registered = false;
        }
        if self.assembler.is_done() {
            self.finish_request(reactor);
        }
    }

    fn on_error(&mut self, reactor: &mut dyn Reactor, error: FcgiError) {
        if self.is_closed() {
            return;
        }
        if error.is_peer_close() {
            debug!(conn = self.id, state = ?self.assembler.state(), error = %error, "peer closed connection");
        } else {
            debug!(conn = self.id, state = ?self.assembler.state(), error = %error, "connection failed");
            self.failure = Some(error);
        }
        self.close(reactor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{
        completion_queue, CompletionReceiver, HandlerResult, ResponseEnvelope, SyncHandler,
    };
    use crate::record::{encode_record, try_extract_frame};
    use crate::records::{BeginRequest, EndRequest, GetValuesResult, Role, FCGI_KEEP_CONN};
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Shared {
        written: Vec<u8>,
        drops: usize,
    }

    struct MockTransport {
        input: VecDeque<Vec<u8>>,
        eof: bool,
        write_limit: usize,
        shared: Arc<Mutex<Shared>>,
    }

    impl MockTransport {
        fn new(shared: Arc<Mutex<Shared>>) -> Self {
            Self {
                input: VecDeque::new(),
                eof: false,
                write_limit: usize::MAX,
                shared,
            }
        }
    }

    impl Transport for MockTransport {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.input.front_mut() else {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.input.pop_front();
            }
            Ok(n)
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.write_limit);
            self.shared.lock().unwrap().written.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    impl Drop for MockTransport {
        fn drop(&mut self) {
            self.shared.lock().unwrap().drops += 1;
        }
    }

    #[derive(Default, Debug)]
    struct MockReactor {
        read: bool,
        write: bool,
        deregisters: usize,
    }

    impl Reactor for MockReactor {
        fn register_read(&mut self) {
            self.read = true;
        }
        fn register_write(&mut self) {
            self.write = true;
        }
        fn unregister_write(&mut self) {
            self.write = false;
        }
        fn deregister(&mut self) {
            self.read = false;
            self.write = false;
            self.deregisters += 1;
        }
    }

    struct Harness {
        conn: Connection<MockTransport>,
        reactor: MockReactor,
        rx: CompletionReceiver,
        shared: Arc<Mutex<Shared>>,
    }

    impl Harness {
        fn new(handler: Arc<dyn RequestHandler>, input: Vec<Vec<u8>>, write_limit: usize) -> Self {
            let shared = Arc::new(Mutex::new(Shared::default()));
            let mut transport = MockTransport::new(Arc::clone(&shared));
            transport.input = input.into();
            transport.write_limit = write_limit;
            let (tx, rx) = completion_queue();
            let mut conn = Connection::new(1, transport, handler, tx, ConnectionConfig::default());
            let mut reactor = MockReactor::default();
            conn.start(&mut reactor);
            Self {
                conn,
                reactor,
                rx,
                shared,
            }
        }

        /// Pump completions and writes until nothing is left to do.
        fn run(&mut self) {
            self.conn.on_readable(&mut self.reactor);
            for _ in 0..100_000 {
                if let Ok(completion) = self.rx.try_recv() {
                    self.conn.on_completion(&mut self.reactor, completion);
                    continue;
                }
                if self.reactor.write && !self.conn.is_closed() {
                    self.conn.on_writable(&mut self.reactor);
                    continue;
                }
                break;
            }
        }

        fn written(&self) -> Vec<u8> {
            self.shared.lock().unwrap().written.clone()
        }
    }

    fn ok_handler() -> Arc<dyn RequestHandler> {
        Arc::new(SyncHandler(|_: &LogicalRequest| -> HandlerResult {
            Ok(ResponseEnvelope::new("OK", 0))
        }))
    }

    fn request_bytes(request_id: u16, flags: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            &BeginRequest {
                request_id,
                role: Role::Responder,
                flags,
            }
            .encode(),
        );
        out.extend_from_slice(&encode_record(RecordType::Params, request_id, &[]).unwrap());
        out.extend_from_slice(&encode_record(RecordType::Stdin, request_id, &[]).unwrap());
        out
    }

    fn expected_ok(request_id: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&encode_record(RecordType::Stdout, request_id, b"OK").unwrap());
        out.extend_from_slice(&encode_record(RecordType::Stdout, request_id, &[]).unwrap());
        out.extend_from_slice(
            &EndRequest {
                request_id,
                app_status: 0,
                protocol_status: crate::records::ProtocolStatus::RequestComplete,
            }
            .encode(),
        );
        out
    }

    fn parse(bytes: &[u8]) -> Vec<Record> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(r) = try_extract_frame(&mut buf).unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn answers_request_and_closes() {
        let mut h = Harness::new(ok_handler(), vec![request_bytes(1, 0)], usize::MAX);
        assert!(h.reactor.read);
        h.run();
        assert_eq!(h.written(), expected_ok(1));
        assert!(h.conn.is_closed());
        assert_eq!(h.reactor.deregisters, 1);
        assert_eq!(h.shared.lock().unwrap().drops, 1);
        assert!(h.conn.take_failure().is_none());
    }

    #[test]
    fn short_writes_are_resumed() {
        let mut h = Harness::new(ok_handler(), vec![request_bytes(1, 0)], 1);
        h.run();
        assert_eq!(h.written(), expected_ok(1));
        assert!(h.conn.is_closed());
    }

    #[test]
    fn input_split_into_tiny_reads() {
        let input: Vec<Vec<u8>> = request_bytes(7, 0).into_iter().map(|b| vec![b]).collect();
        let mut h = Harness::new(ok_handler(), input, usize::MAX);
        h.run();
        assert_eq!(h.written(), expected_ok(7));
    }

    #[test]
    fn write_interest_only_while_queued() {
        let mut h = Harness::new(ok_handler(), vec![request_bytes(1, FCGI_KEEP_CONN)], usize::MAX);
        h.conn.on_readable(&mut h.reactor);
        assert!(!h.reactor.write);
        let completion = h.rx.try_recv().unwrap();
        h.conn.on_completion(&mut h.reactor, completion);
        assert!(h.reactor.write);
        h.conn.on_writable(&mut h.reactor);
        assert!(!h.reactor.write);
        assert!(!h.conn.is_closed());
        assert_eq!(h.conn.state(), State::AwaitBegin);
    }

    #[test]
    fn get_values_is_answered_without_a_request() {
        let query = GetValues {
            names: vec![FCGI_MPXS_CONNS.to_string(), FCGI_MAX_CONNS.to_string()],
        }
        .encode()
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Arc<dyn RequestHandler> = Arc::new(SyncHandler(move |_: &LogicalRequest| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ResponseEnvelope::default())
        }));
        let mut h = Harness::new(handler, vec![query.to_vec()], usize::MAX);
        h.run();
        let records = parse(&h.written());
        assert_eq!(records.len(), 1);
        let result = GetValuesResult::decode(&records[0]).unwrap();
        assert_eq!(
            result.values,
            vec![
                (FCGI_MPXS_CONNS.to_string(), "0".to_string()),
                (FCGI_MAX_CONNS.to_string(), "64".to_string()),
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.conn.state(), State::AwaitBegin);
        assert!(!h.conn.is_closed());
    }

    #[test]
    fn management_interleaved_with_request() {
        let req = request_bytes(1, 0);
        let mut input = Vec::new();
        // BEGIN_REQUEST is the first 16 bytes.
        input.extend_from_slice(&req[..16]);
        input.extend_from_slice(&encode_record(RecordType::GetValues, 0, &[]).unwrap());
        input.extend_from_slice(&encode_record(RecordType::Data, 0, &[]).unwrap());
        input.extend_from_slice(&req[16..]);
        let mut h = Harness::new(ok_handler(), vec![input], usize::MAX);
        h.run();
        let records = parse(&h.written());
        let kinds: Vec<_> = records.iter().map(|r| r.kind().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                RecordType::GetValuesResult,
                RecordType::UnknownType,
                RecordType::Stdout,
                RecordType::Stdout,
                RecordType::EndRequest,
            ]
        );
        assert_eq!(records[1].content[0], RecordType::Data.as_u8());
    }

    #[test]
    fn protocol_violation_closes_with_failure() {
        let params = encode_record(RecordType::Params, 1, &[]).unwrap();
        let mut h = Harness::new(ok_handler(), vec![params.to_vec()], usize::MAX);
        h.run();
        assert!(h.conn.is_closed());
        assert!(h.written().is_empty());
        assert!(matches!(
            h.conn.take_failure(),
            Some(FcgiError::UnexpectedRecord { .. })
        ));
    }

    #[test]
    fn error_path_is_idempotent() {
        let mut h = Harness::new(ok_handler(), vec![], usize::MAX);
        h.conn
            .on_error(&mut h.reactor, io::Error::from(io::ErrorKind::ConnectionReset).into());
        h.conn
            .on_error(&mut h.reactor, io::Error::from(io::ErrorKind::ConnectionReset).into());
        assert_eq!(h.reactor.deregisters, 1);
        assert_eq!(h.shared.lock().unwrap().drops, 1);
        h.conn.on_readable(&mut h.reactor);
        h.conn.on_writable(&mut h.reactor);
        assert_eq!(h.reactor.deregisters, 1);
    }

    #[test]
    fn result_after_peer_close_is_discarded() {
        let mut h = Harness::new(ok_handler(), vec![request_bytes(1, 0)], usize::MAX);
        h.conn.on_readable(&mut h.reactor);
        assert_eq!(h.conn.state(), State::Handling);
        h.conn.transport.as_mut().unwrap().eof = true;
        h.conn.on_readable(&mut h.reactor);
        assert!(h.conn.is_closed());
        assert!(h.conn.take_failure().is_none());

        let completion = h.rx.try_recv().unwrap();
        h.conn.on_completion(&mut h.reactor, completion);
        assert!(h.written().is_empty());
        assert!(!h.reactor.write);
    }

    #[test]
    fn keep_conn_serves_sequential_requests() {
        let mut h = Harness::new(ok_handler(), vec![request_bytes(1, FCGI_KEEP_CONN)], usize::MAX);
        h.run();
        assert_eq!(h.written(), expected_ok(1));
        assert!(!h.conn.is_closed());
        assert_eq!(h.conn.state(), State::AwaitBegin);

        h.conn
            .transport
            .as_mut()
            .unwrap()
            .input
            .push_back(request_bytes(2, 0));
        h.run();
        let mut expected = expected_ok(1);
        expected.extend_from_slice(&expected_ok(2));
        assert_eq!(h.written(), expected);
        assert_eq!(h.conn.completed_requests(), 2);
        assert!(h.conn.is_closed());
    }

    #[test]
    fn rejected_role_tail_after_flush_keeps_connection() {
        let begin = BeginRequest {
            request_id: 3,
            role: Role::Filter,
            flags: FCGI_KEEP_CONN,
        }
        .encode();
        let mut h = Harness::new(ok_handler(), vec![begin.to_vec()], usize::MAX);
        h.run();
        assert!(!h.conn.is_closed());
        assert_eq!(h.conn.state(), State::AwaitBegin);

        // The rest of the rejected request arrives in a later segment.
        let mut tail = Vec::new();
        tail.extend_from_slice(&encode_record(RecordType::Params, 3, &[]).unwrap());
        tail.extend_from_slice(&encode_record(RecordType::Stdin, 3, &[]).unwrap());
        tail.extend_from_slice(&encode_record(RecordType::Data, 3, &[]).unwrap());
        tail.extend_from_slice(&request_bytes(4, 0));
        h.conn.transport.as_mut().unwrap().input.push_back(tail);
        h.run();

        assert!(h.conn.take_failure().is_none());
        let records = parse(&h.written());
        let rejected = EndRequest::decode(&records[0]).unwrap();
        assert_eq!(rejected.request_id, 3);
        assert_eq!(rejected.protocol_status, crate::records::ProtocolStatus::UnknownRole);
        assert_eq!(h.written()[records[0].header.frame_len()..], expected_ok(4)[..]);
        assert!(h.conn.is_closed());
    }

    #[test]
    fn abort_tail_after_flush_keeps_connection() {
        let mut input = request_bytes(5, FCGI_KEEP_CONN);
        // Drop the STDIN terminator so the abort lands while stdin is open.
        input.truncate(input.len() - 8);
        input.extend_from_slice(&encode_record(RecordType::AbortRequest, 5, &[]).unwrap());
        let mut h = Harness::new(ok_handler(), vec![input], usize::MAX);
        h.run();
        assert!(!h.conn.is_closed());

        let mut tail = encode_record(RecordType::Stdin, 5, &[]).unwrap().to_vec();
        tail.extend_from_slice(&request_bytes(6, 0));
        h.conn.transport.as_mut().unwrap().input.push_back(tail);
        h.run();

        assert!(h.conn.take_failure().is_none());
        let records = parse(&h.written());
        assert_eq!(EndRequest::decode(&records[0]).unwrap().request_id, 5);
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].request_id(), 6);
        assert_eq!(h.conn.completed_requests(), 2);
    }

    #[test]
    fn second_begin_while_active_is_refused() {
        let mut input = request_bytes(1, 0);
        input.extend_from_slice(
            &BeginRequest {
                request_id: 2,
                role: Role::Responder,
                flags: 0,
            }
            .encode(),
        );
        let mut h = Harness::new(ok_handler(), vec![input], usize::MAX);
        h.run();
        let records = parse(&h.written());
        let first = EndRequest::decode(&records[0]).unwrap();
        assert_eq!(first.request_id, 2);
        assert_eq!(first.protocol_status, crate::records::ProtocolStatus::CantMpxConn);
        assert_eq!(records.len(), 4);
        assert_eq!(records[1].request_id(), 1);
        assert!(h.conn.is_closed());
    }

    #[test]
    fn buffered_input_cap_fails_connection() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let mut transport = MockTransport::new(Arc::clone(&shared));
        // A header announcing 65535 content bytes that never fully arrive.
        let mut input = vec![1u8, 5, 0, 1, 0xFF, 0xFF, 0, 0];
        input.extend_from_slice(&[0u8; 100]);
        transport.input = vec![input].into();
        let (tx, _rx) = completion_queue();
        let config = ConnectionConfig {
            max_buffered_bytes: 64,
            ..ConnectionConfig::default()
        };
        let mut conn = Connection::new(1, transport, ok_handler(), tx, config);
        let mut reactor = MockReactor::default();
        conn.start(&mut reactor);
        conn.on_readable(&mut reactor);
        assert!(conn.is_closed());
        assert!(matches!(
            conn.take_failure(),
            Some(FcgiError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn abort_while_handling() {
        let mut input = request_bytes(1, 0);
        input.extend_from_slice(&encode_record(RecordType::AbortRequest, 1, &[]).unwrap());
        let mut h = Harness::new(ok_handler(), vec![input], usize::MAX);
        h.run();
        let records = parse(&h.written());
        assert_eq!(records.len(), 1);
        let end = EndRequest::decode(&records[0]).unwrap();
        assert_eq!(end.request_id, 1);
        assert!(h.conn.is_closed());
    }

    #[test]
    fn stderr_and_large_stdout() {
        let body = Bytes::from(vec![b'x'; 70_000]);
        let handler: Arc<dyn RequestHandler> = Arc::new(SyncHandler(move |_: &LogicalRequest| -> HandlerResult {
            Ok(ResponseEnvelope::new(body.clone(), 3).with_stderr("warn"))
        }));
        let mut h = Harness::new(handler, vec![request_bytes(1, 0)], 1000);
        h.run();
        let records = parse(&h.written());
        let kinds: Vec<_> = records.iter().map(|r| r.kind().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                RecordType::Stdout,
                RecordType::Stdout,
                RecordType::Stdout,
                RecordType::Stderr,
                RecordType::Stderr,
                RecordType::EndRequest,
            ]
        );
        assert_eq!(records[0].content.len(), 65535);
        assert_eq!(records[1].content.len(), 70_000 - 65535);
        assert_eq!(EndRequest::decode(&records[5]).unwrap().app_status, 3);
    }
}
