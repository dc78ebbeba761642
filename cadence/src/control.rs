//! Control channel wire protocol and command execution.
//!
//! Companions drive the host over a byte stream of framed commands. Every
//! frame is a fixed 8-byte header followed by a payload:
//!
//! ```text
//! ┌──────────┬──────────┬─────────────┬────────────────────┐
//! │ code (1) │ rsvd (1) │ task id (2) │ payload length (4) │
//! └──────────┴──────────┴─────────────┴────────────────────┘
//! ```
//!
//! All integers are little-endian. Responses echo the request code with the
//! high bit set and carry a status byte as the first payload byte; error
//! responses append a human-readable message.
//!
//! Version fail-closed rule: once `CHECK_VERSION` reported a mismatch for a
//! task, every further operation this session attempts on that task answers
//! `VersionMismatch` until the session ends.

use crate::channel::{ChannelDescriptor, ChannelSpace};
use crate::error::HostError;
use crate::task::{Task, TaskId, TaskRegistry};
use crate::trace::debug;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Request codes. Responses use `code | RESPONSE_FLAG`.
pub mod command_code {
    pub const LIST_ACTIVE: u8 = 0x01;
    pub const GET_PROPERTIES: u8 = 0x02;
    pub const GET_CHANNEL_INFO: u8 = 0x03;
    pub const GET_PARAMETERS: u8 = 0x04;
    pub const SET_PARAMETERS: u8 = 0x05;
    pub const PATCH_PARAMETERS: u8 = 0x06;
    pub const CHECK_VERSION: u8 = 0x07;
    pub const RESPONSE_FLAG: u8 = 0x80;
}

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single payload; anything larger is a protocol error and
/// the session is closed.
pub const MAX_PAYLOAD: usize = 1 << 24;

/// Wire status byte of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    OutOfRange = 1,
    VersionMismatch = 2,
    NotSupported = 3,
    Overflow = 4,
    Aborted = 5,
    Busy = 6,
    BadRequest = 7,
    NoSuchTask = 8,
}

impl Status {
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Status::Ok,
            1 => Status::OutOfRange,
            2 => Status::VersionMismatch,
            3 => Status::NotSupported,
            4 => Status::Overflow,
            5 => Status::Aborted,
            6 => Status::Busy,
            7 => Status::BadRequest,
            8 => Status::NoSuchTask,
            _ => return None,
        })
    }
}

impl From<&HostError> for Status {
    fn from(err: &HostError) -> Self {
        match err {
            HostError::OutOfRange(_) => Status::OutOfRange,
            HostError::VersionMismatch { .. } => Status::VersionMismatch,
            HostError::NotSupported(_) => Status::NotSupported,
            HostError::Overflow => Status::Overflow,
            HostError::Aborted(_) => Status::Aborted,
            HostError::Busy(_) => Status::Busy,
        }
    }
}

/// Unrecoverable framing faults; the session must be closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    Oversized(u32),
}

/// One framed message, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub task: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(code: u8, task: u16, payload: Vec<u8>) -> Self {
        Frame {
            code,
            task,
            payload,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.code);
        out.push(0);
        out.extend_from_slice(&self.task.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Status byte of a response frame.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.payload.first().and_then(|&raw| Status::from_wire(raw))
    }

    /// Response payload after the status byte.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or(&[])
    }
}

/// Tries to peel one frame off the front of `buf`. Returns the frame and
/// the number of bytes consumed, or `None` when more bytes are needed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let code = buf[0];
    let task = u16::from_le_bytes([buf[2], buf[3]]);
    let payload_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if payload_len as usize > MAX_PAYLOAD {
        return Err(ProtocolError::Oversized(payload_len));
    }
    let total = HEADER_LEN + payload_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = buf[HEADER_LEN..total].to_vec();
    Ok(Some((Frame::new(code, task, payload), total)))
}

/// Little-endian payload reader; every accessor fails with `BadRequest`.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Status> {
        let end = self.pos.checked_add(n).ok_or(Status::BadRequest)?;
        let slice = self.buf.get(self.pos..end).ok_or(Status::BadRequest)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Status> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, Status> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn done(&self) -> Result<(), Status> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Status::BadRequest)
        }
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let len = s.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&s.as_bytes()[..len]);
}

/// Per-session fail-closed state for version checks.
#[derive(Debug, Default)]
pub struct SessionGate {
    mismatched: HashSet<u16>,
}

impl SessionGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_mismatched(&self, task: u16) -> bool {
        self.mismatched.contains(&task)
    }
}

/// Executes control frames against the task registry.
pub struct ControlEngine<'a> {
    registry: &'a TaskRegistry,
}

impl<'a> ControlEngine<'a> {
    #[must_use]
    pub fn new(registry: &'a TaskRegistry) -> Self {
        ControlEngine { registry }
    }

    /// Runs one request and produces its response frame. Per-session
    /// failures never panic and never affect other sessions.
    pub fn execute(&self, gate: &mut SessionGate, frame: &Frame) -> Frame {
        use command_code as cc;

        if frame.code == cc::LIST_ACTIVE {
            let mut payload = Vec::with_capacity(4);
            payload.extend_from_slice(&self.registry.active_mask().to_le_bytes());
            return ok_response(frame, payload);
        }

        // Everything below addresses one task.
        if gate.is_mismatched(frame.task) {
            return error_response(frame, Status::VersionMismatch, "revision check failed earlier");
        }
        let Some(task) = self.registry.get(TaskId::from_raw(frame.task)) else {
            return error_response(frame, Status::NoSuchTask, "no task in that slot");
        };

        let outcome = match frame.code {
            cc::GET_PROPERTIES => Ok(properties_payload(&task)),
            cc::GET_CHANNEL_INFO => self.channel_info(&task, &frame.payload),
            cc::GET_PARAMETERS => task
                .get_parameters()
                .map(|block| block.as_ref().to_vec())
                .map_err(|e| (Status::from(&e), e.to_string())),
            cc::SET_PARAMETERS => task
                .set_parameters(&frame.payload)
                .map(|()| Vec::new())
                .map_err(|e| (Status::from(&e), e.to_string())),
            cc::PATCH_PARAMETERS => self.patch(&task, &frame.payload),
            cc::CHECK_VERSION => self.check_version(gate, &task, frame),
            other => {
                debug!(code = other, "unknown control code");
                Err((Status::BadRequest, format!("unknown command 0x{other:02x}")))
            }
        };

        match outcome {
            Ok(payload) => ok_response(frame, payload),
            Err((status, message)) => error_response(frame, status, &message),
        }
    }

    fn channel_info(
        &self,
        task: &Arc<Task>,
        payload: &[u8],
    ) -> Result<Vec<u8>, (Status, String)> {
        let mut rd = Reader::new(payload);
        let parse = (|| {
            let space = match rd.u8()? {
                0 => ChannelSpace::Signal,
                1 => ChannelSpace::Parameter,
                _ => return Err(Status::BadRequest),
            };
            let index = rd.u32()?;
            rd.done()?;
            Ok((space, index))
        })();
        let (space, index) =
            parse.map_err(|s| (s, "malformed channel query".to_owned()))?;

        let table = match space {
            ChannelSpace::Signal => task.signals(),
            ChannelSpace::Parameter => task.parameters(),
        };
        let Some(ch) = table.iter().find(|ch| ch.index == index) else {
            return Err((
                Status::OutOfRange,
                format!("no channel {index} in that space"),
            ));
        };
        Ok(channel_payload(ch))
    }

    fn patch(&self, task: &Arc<Task>, payload: &[u8]) -> Result<Vec<u8>, (Status, String)> {
        let mut rd = Reader::new(payload);
        let parse = (|| {
            let block_len = rd.u32()? as usize;
            let block = rd.bytes(block_len)?;
            let count = rd.u32()? as usize;
            // Each range is 8 bytes; anything else cannot be exact.
            if count.checked_mul(8) != Some(rd.remaining()) {
                return Err(Status::BadRequest);
            }
            let mut ranges = Vec::with_capacity(count);
            for _ in 0..count {
                let offset = rd.u32()?;
                let len = rd.u32()?;
                ranges.push((offset, len));
            }
            rd.done()?;
            Ok((block, ranges))
        })();
        let (block, ranges) = parse.map_err(|s| (s, "malformed patch".to_owned()))?;
        task.patch_parameters(block, &ranges)
            .map(|()| Vec::new())
            .map_err(|e| (Status::from(&e), e.to_string()))
    }

    fn check_version(
        &self,
        gate: &mut SessionGate,
        task: &Arc<Task>,
        frame: &Frame,
    ) -> Result<Vec<u8>, (Status, String)> {
        let expected = std::str::from_utf8(&frame.payload)
            .map_err(|_| (Status::BadRequest, "revision is not UTF-8".to_owned()))?;
        if expected == task.version() {
            Ok(Vec::new())
        } else {
            gate.mismatched.insert(frame.task);
            Err((
                Status::VersionMismatch,
                format!("task revision is `{}`", task.version()),
            ))
        }
    }
}

fn ok_response(request: &Frame, body: Vec<u8>) -> Frame {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(Status::Ok.as_wire());
    payload.extend_from_slice(&body);
    Frame::new(
        request.code | command_code::RESPONSE_FLAG,
        request.task,
        payload,
    )
}

fn error_response(request: &Frame, status: Status, message: &str) -> Frame {
    let mut payload = Vec::with_capacity(1 + message.len());
    payload.push(status.as_wire());
    payload.extend_from_slice(message.as_bytes());
    Frame::new(
        request.code | command_code::RESPONSE_FLAG,
        request.task,
        payload,
    )
}

fn properties_payload(task: &Arc<Task>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(task.state_image_size() as u32).to_le_bytes());
    out.extend_from_slice(&(task.param_block_size() as u32).to_le_bytes());
    out.extend_from_slice(&(task.ring().capacity() as u32).to_le_bytes());
    out.extend_from_slice(&(task.sub_task_count() as u32).to_le_bytes());
    out.extend_from_slice(&(task.signals().len() as u32).to_le_bytes());
    out.extend_from_slice(&(task.parameters().len() as u32).to_le_bytes());
    for period in task.periods() {
        out.extend_from_slice(&(period.as_nanos() as u64).to_le_bytes());
    }
    put_str(&mut out, task.name());
    put_str(&mut out, task.version());
    match task.abort_reason() {
        Some(reason) => {
            out.push(1);
            put_str(&mut out, &reason);
        }
        None => {
            out.push(0);
            put_str(&mut out, "");
        }
    }
    out
}

fn channel_payload(ch: &ChannelDescriptor) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&ch.index.to_le_bytes());
    out.extend_from_slice(&(ch.offset as u32).to_le_bytes());
    out.extend_from_slice(&ch.rows.to_le_bytes());
    out.extend_from_slice(&ch.cols.to_le_bytes());
    out.push(ch.elem.as_wire());
    out.push(ch.elem.width() as u8);
    put_str(&mut out, &ch.name);
    put_str(&mut out, &ch.path);
    out
}

/// Builds a `PATCH_PARAMETERS` payload; companion-side helper, also used by
/// tests.
#[must_use]
pub fn patch_payload(block: &[u8], ranges: &[(u32, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + block.len() + ranges.len() * 8);
    out.extend_from_slice(&(block.len() as u32).to_le_bytes());
    out.extend_from_slice(block);
    out.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
    for &(offset, len) in ranges {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ElemType;
    use crate::config::HostConfig;
    use crate::task::{StepFault, TaskDescriptor, TaskStep};
    use std::time::Duration;

    struct EchoParams;

    impl TaskStep for EchoParams {
        fn step(&mut self, _sub: usize, image: &mut [u8], params: &[u8]) -> Result<(), StepFault> {
            let n = params.len().min(image.len());
            image[..n].copy_from_slice(&params[..n]);
            Ok(())
        }
    }

    fn registry_with_task() -> (TaskRegistry, u16) {
        let reg = TaskRegistry::new(HostConfig::default());
        let mut desc = TaskDescriptor::new(
            "plant",
            "plant-2.3",
            vec![Duration::from_millis(1), Duration::from_millis(4)],
            8,
            Box::new(EchoParams),
        );
        desc.initial_params = vec![0u8; 8];
        desc.signals = vec![ChannelDescriptor::vector(0, "/plant/out", 0, 2, ElemType::F32)];
        desc.parameters = vec![ChannelDescriptor::vector(0, "/plant/gain", 0, 1, ElemType::F64)];
        let task = reg.register(desc).unwrap();
        let id = task.id().as_raw();
        (reg, id)
    }

    fn run(reg: &TaskRegistry, gate: &mut SessionGate, frame: Frame) -> Frame {
        ControlEngine::new(reg).execute(gate, &frame)
    }

    #[test]
    fn frames_round_trip_through_the_codec() {
        let frame = Frame::new(command_code::SET_PARAMETERS, 3, vec![1, 2, 3]);
        let bytes = frame.encode();

        // Partial header, then partial payload, then the whole thing.
        assert!(decode_frame(&bytes[..4]).unwrap().is_none());
        assert!(decode_frame(&bytes[..HEADER_LEN + 1]).unwrap().is_none());
        let (decoded, used) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn oversized_payload_is_fatal() {
        let mut header = vec![command_code::SET_PARAMETERS, 0, 0, 0];
        header.extend_from_slice(&(MAX_PAYLOAD as u32 + 1).to_le_bytes());
        assert!(matches!(
            decode_frame(&header),
            Err(ProtocolError::Oversized(_))
        ));
    }

    #[test]
    fn list_active_reports_slot_mask() {
        let (reg, id) = registry_with_task();
        let mut gate = SessionGate::new();
        let resp = run(&reg, &mut gate, Frame::new(command_code::LIST_ACTIVE, 0, vec![]));
        assert_eq!(resp.status(), Some(Status::Ok));
        let mask = u32::from_le_bytes(resp.body()[0..4].try_into().unwrap());
        assert_eq!(mask, 1 << id);
    }

    #[test]
    fn properties_describe_the_task() {
        let (reg, id) = registry_with_task();
        let mut gate = SessionGate::new();
        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::GET_PROPERTIES, id, vec![]),
        );
        assert_eq!(resp.status(), Some(Status::Ok));
        let body = resp.body();
        assert_eq!(u32::from_le_bytes(body[0..4].try_into().unwrap()), 8); // image
        assert_eq!(u32::from_le_bytes(body[4..8].try_into().unwrap()), 8); // params
        assert_eq!(u32::from_le_bytes(body[12..16].try_into().unwrap()), 2); // sub-tasks
        let p0 = u64::from_le_bytes(body[24..32].try_into().unwrap());
        assert_eq!(p0, 1_000_000);
    }

    #[test]
    fn channel_info_finds_and_bounds() {
        let (reg, id) = registry_with_task();
        let mut gate = SessionGate::new();

        let mut query = vec![0u8]; // signal space
        query.extend_from_slice(&0u32.to_le_bytes());
        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::GET_CHANNEL_INFO, id, query),
        );
        assert_eq!(resp.status(), Some(Status::Ok));
        let body = resp.body();
        assert_eq!(body[16], ElemType::F32.as_wire());
        assert_eq!(body[17], 4);

        let mut query = vec![0u8];
        query.extend_from_slice(&7u32.to_le_bytes());
        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::GET_CHANNEL_INFO, id, query),
        );
        assert_eq!(resp.status(), Some(Status::OutOfRange));
    }

    #[test]
    fn parameter_round_trip_via_engine() {
        let (reg, id) = registry_with_task();
        let mut gate = SessionGate::new();

        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::SET_PARAMETERS, id, vec![7u8; 8]),
        );
        assert_eq!(resp.status(), Some(Status::Ok));

        // Staged block becomes live at the tick boundary.
        reg.get(TaskId::from_raw(id)).unwrap().tick(0).unwrap();

        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::GET_PARAMETERS, id, vec![]),
        );
        assert_eq!(resp.status(), Some(Status::Ok));
        assert_eq!(resp.body(), &[7u8; 8]);
    }

    #[test]
    fn failed_patch_keeps_previous_block() {
        let (reg, id) = registry_with_task();
        let mut gate = SessionGate::new();
        let task = reg.get(TaskId::from_raw(id)).unwrap();

        run(
            &reg,
            &mut gate,
            Frame::new(command_code::SET_PARAMETERS, id, vec![5u8; 8]),
        );
        let bad = patch_payload(&[9u8; 8], &[(6, 4)]);
        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::PATCH_PARAMETERS, id, bad),
        );
        assert_eq!(resp.status(), Some(Status::OutOfRange));

        task.tick(0).unwrap();
        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::GET_PARAMETERS, id, vec![]),
        );
        assert_eq!(resp.body(), &[5u8; 8]);
    }

    #[test]
    fn version_mismatch_fails_closed_per_session() {
        let (reg, id) = registry_with_task();
        let mut gate = SessionGate::new();

        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::CHECK_VERSION, id, b"plant-9.9".to_vec()),
        );
        assert_eq!(resp.status(), Some(Status::VersionMismatch));

        // Every further operation on that task fails on this session.
        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::GET_PARAMETERS, id, vec![]),
        );
        assert_eq!(resp.status(), Some(Status::VersionMismatch));

        // A fresh session is unaffected.
        let mut other = SessionGate::new();
        let resp = run(
            &reg,
            &mut other,
            Frame::new(command_code::GET_PARAMETERS, id, vec![]),
        );
        assert_eq!(resp.status(), Some(Status::Ok));

        // And the matching revision passes.
        let resp = run(
            &reg,
            &mut other,
            Frame::new(command_code::CHECK_VERSION, id, b"plant-2.3".to_vec()),
        );
        assert_eq!(resp.status(), Some(Status::Ok));
    }

    #[test]
    fn unknown_code_and_missing_task() {
        let (reg, id) = registry_with_task();
        let mut gate = SessionGate::new();

        let resp = run(&reg, &mut gate, Frame::new(0x44, id, vec![]));
        assert_eq!(resp.status(), Some(Status::BadRequest));

        let resp = run(
            &reg,
            &mut gate,
            Frame::new(command_code::GET_PROPERTIES, 9, vec![]),
        );
        assert_eq!(resp.status(), Some(Status::NoSuchTask));
    }
}
