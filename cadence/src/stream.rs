//! Channel subscription and streaming encoder.
//!
//! Each telemetry session owns one [`StreamEngine`]: a table of channel
//! subscriptions evaluated against the task's slice history every time the
//! server drains a snapshot. Output is framed text:
//!
//! ```text
//! <data level="25" time="1735.004321">
//! <F c="0" d="1.5,2.5,3.5"/>
//! <E c="2" d="1"/>
//! </data>
//! ```
//!
//! `<F>` frames carry periodic blocks (decimated, optionally
//! delta-compressed), `<E>` frames carry event-mode changes. The batch
//! header appears only when at least one subscription emits, and tags the
//! ring fill level and the slice timestamp.

use crate::channel::{ChannelDescriptor, ElemType};
use crate::error::HostError;
use crate::task::{STATS_LEN, TaskStats};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// When an event-mode subscription fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventPolicy {
    /// Fire only when the value changes away from all-zero. Repeated
    /// nonzero-to-nonzero changes stay quiet until the value returns to
    /// zero first.
    #[default]
    RisingEdge,
    /// Fire on every change.
    AnyChange,
}

/// Payload encoding of a frame's `d` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Text,
    Hex,
    Base64,
}

impl Encoding {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "text" => Encoding::Text,
            "hex" => Encoding::Hex,
            "base64" => Encoding::Base64,
            _ => return None,
        })
    }
}

/// What a companion asked for with a `<start .../>` command.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionSpec {
    /// Channel index within the task's signal space.
    pub channel: u32,
    /// Emit every N-th snapshot; clamped to at least 1.
    pub decimation: u32,
    /// Values per periodic frame; clamped to at least 1, forced to 1 in
    /// event mode.
    pub block: u32,
    pub event: bool,
    pub encoding: Encoding,
    /// Delta-compress periodic blocks; silently disabled for unsigned
    /// element types.
    pub delta: bool,
}

impl Default for SubscriptionSpec {
    fn default() -> Self {
        SubscriptionSpec {
            channel: 0,
            decimation: 1,
            block: 1,
            event: false,
            encoding: Encoding::Text,
            delta: false,
        }
    }
}

/// In-process copy of recent ring slices, so the streaming side can gather
/// decimated blocks long after the ring's read pointer moved on.
pub struct SliceHistory {
    slice_len: usize,
    state_image_size: usize,
    capacity: usize,
    buf: Vec<u8>,
    next_seq: u64,
}

impl SliceHistory {
    #[must_use]
    pub fn new(slice_len: usize, state_image_size: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SliceHistory {
            slice_len,
            state_image_size,
            capacity,
            buf: vec![0u8; slice_len * capacity],
            next_seq: 0,
        }
    }

    /// Appends one slice; the oldest is overwritten once the history is
    /// full. Returns the sequence number assigned.
    pub fn push(&mut self, slice: &[u8]) -> u64 {
        debug_assert_eq!(slice.len(), self.slice_len);
        let seq = self.next_seq;
        let slot = (seq % self.capacity as u64) as usize * self.slice_len;
        self.buf[slot..slot + self.slice_len].copy_from_slice(slice);
        self.next_seq = seq + 1;
        seq
    }

    /// The whole slice at `seq`, if it is still retained.
    #[must_use]
    pub fn slice(&self, seq: u64) -> Option<&[u8]> {
        if seq >= self.next_seq || self.next_seq - seq > self.capacity as u64 {
            return None;
        }
        let slot = (seq % self.capacity as u64) as usize * self.slice_len;
        Some(&self.buf[slot..slot + self.slice_len])
    }

    /// A channel's bytes within the slice at `seq`.
    #[must_use]
    pub fn channel_bytes(&self, seq: u64, ch: &ChannelDescriptor) -> Option<&[u8]> {
        let slice = self.slice(seq)?;
        let image = slice.get(..self.state_image_size)?;
        image.get(ch.offset..ch.offset + ch.byte_len())
    }

    /// Wall-clock timestamp of the slice at `seq`, from the first stats
    /// trailer.
    #[must_use]
    pub fn timestamp(&self, seq: u64) -> Option<(u64, u32)> {
        let slice = self.slice(seq)?;
        let trailer = slice.get(self.state_image_size..self.state_image_size + STATS_LEN)?;
        let stats = TaskStats::from_bytes(trailer)?;
        Some((stats.seconds, stats.nanos))
    }
}

struct Subscription {
    desc: ChannelDescriptor,
    spec: SubscriptionSpec,
    /// Last observed value for event comparison.
    last: Option<Vec<u8>>,
}

/// Per-session subscription table and frame renderer.
pub struct StreamEngine {
    subs: Vec<Subscription>,
    policy: EventPolicy,
}

impl StreamEngine {
    #[must_use]
    pub fn new(policy: EventPolicy) -> Self {
        StreamEngine {
            subs: Vec::new(),
            policy,
        }
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Adds or replaces the subscription for `desc`'s channel.
    pub fn subscribe(
        &mut self,
        desc: &ChannelDescriptor,
        spec: SubscriptionSpec,
    ) -> Result<(), HostError> {
        if spec.channel != desc.index {
            return Err(HostError::out_of_range(format!(
                "subscription for channel {} given descriptor {}",
                spec.channel, desc.index
            )));
        }
        let mut spec = spec;
        spec.decimation = spec.decimation.max(1);
        spec.block = if spec.event { 1 } else { spec.block.max(1) };
        if spec.delta && desc.elem.is_unsigned() {
            spec.delta = false;
        }
        let sub = Subscription {
            desc: desc.clone(),
            spec,
            last: None,
        };
        match self.subs.iter_mut().find(|s| s.desc.index == desc.index) {
            Some(existing) => *existing = sub,
            None => self.subs.push(sub),
        }
        Ok(())
    }

    /// Removes a subscription; `false` if none existed.
    pub fn unsubscribe(&mut self, channel: u32) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.desc.index != channel);
        self.subs.len() != before
    }

    pub fn clear(&mut self) {
        self.subs.clear();
    }

    /// Evaluates every subscription against the slice at `seq`, appending
    /// rendered frames to `out`. A batch header wraps the output only when
    /// something fired.
    pub fn on_slice(
        &mut self,
        hist: &SliceHistory,
        seq: u64,
        fill_percent: u8,
        out: &mut String,
    ) {
        let mut body = String::new();
        for sub in &mut self.subs {
            if sub.spec.event {
                render_event(sub, hist, seq, self.policy, &mut body);
            } else {
                render_periodic(sub, hist, seq, &mut body);
            }
        }
        if body.is_empty() {
            return;
        }
        let (secs, nanos) = hist.timestamp(seq).unwrap_or((0, 0));
        let _ = writeln!(
            out,
            "<data level=\"{fill_percent}\" time=\"{secs}.{:06}\">",
            nanos / 1_000
        );
        out.push_str(&body);
        out.push_str("</data>\n");
    }
}

fn render_periodic(sub: &mut Subscription, hist: &SliceHistory, seq: u64, out: &mut String) {
    let dec = u64::from(sub.spec.decimation);
    let block = u64::from(sub.spec.block);
    if seq % (dec * block) != 0 {
        return;
    }
    let span = dec * (block - 1);
    if seq < span {
        // Not enough history yet for a full block.
        return;
    }

    let mut raw = Vec::with_capacity(sub.desc.byte_len() * block as usize);
    for k in 0..block {
        let s = seq - dec * (block - 1 - k);
        let Some(bytes) = hist.channel_bytes(s, &sub.desc) else {
            return;
        };
        raw.extend_from_slice(bytes);
    }
    if sub.spec.delta {
        apply_delta(&mut raw, sub.desc.elem);
    }

    let _ = write!(out, "<F c=\"{}\" d=\"", sub.desc.index);
    encode_payload(&raw, sub.desc.elem, sub.spec.encoding, out);
    out.push_str("\"/>\n");
}

fn render_event(
    sub: &mut Subscription,
    hist: &SliceHistory,
    seq: u64,
    policy: EventPolicy,
    out: &mut String,
) {
    let Some(cur) = hist.channel_bytes(seq, &sub.desc) else {
        return;
    };
    let fire = match sub.last.as_deref() {
        // First observation establishes the baseline without firing.
        None => false,
        Some(last) if last == cur => false,
        Some(last) => match policy {
            EventPolicy::AnyChange => true,
            EventPolicy::RisingEdge => last.iter().all(|&b| b == 0),
        },
    };
    sub.last = Some(cur.to_vec());
    if !fire {
        return;
    }
    let _ = write!(out, "<E c=\"{}\" d=\"", sub.desc.index);
    encode_payload(cur, sub.desc.elem, sub.spec.encoding, out);
    out.push_str("\"/>\n");
}

/// In-place backward difference over the element grid. Unsigned types never
/// reach this point; integer differences wrap.
fn apply_delta(raw: &mut [u8], elem: ElemType) {
    macro_rules! grad_int {
        ($t:ty) => {{
            const W: usize = std::mem::size_of::<$t>();
            let n = raw.len() / W;
            for i in (1..n).rev() {
                let a = <$t>::from_le_bytes(raw[i * W..(i + 1) * W].try_into().unwrap_or([0; W]));
                let b =
                    <$t>::from_le_bytes(raw[(i - 1) * W..i * W].try_into().unwrap_or([0; W]));
                raw[i * W..(i + 1) * W].copy_from_slice(&a.wrapping_sub(b).to_le_bytes());
            }
        }};
    }
    macro_rules! grad_float {
        ($t:ty) => {{
            const W: usize = std::mem::size_of::<$t>();
            let n = raw.len() / W;
            for i in (1..n).rev() {
                let a = <$t>::from_le_bytes(raw[i * W..(i + 1) * W].try_into().unwrap_or([0; W]));
                let b =
                    <$t>::from_le_bytes(raw[(i - 1) * W..i * W].try_into().unwrap_or([0; W]));
                raw[i * W..(i + 1) * W].copy_from_slice(&(a - b).to_le_bytes());
            }
        }};
    }
    match elem {
        ElemType::I8 => grad_int!(i8),
        ElemType::I16 => grad_int!(i16),
        ElemType::I32 => grad_int!(i32),
        ElemType::I64 => grad_int!(i64),
        ElemType::F32 => grad_float!(f32),
        ElemType::F64 => grad_float!(f64),
        // Unsigned types are filtered out at subscription time.
        ElemType::U8 | ElemType::U16 | ElemType::U32 | ElemType::U64 => {}
    }
}

/// Renders `raw` (a whole number of elements) into the frame's `d`
/// attribute. Hex and base64 operate on raw bytes, never element counts.
fn encode_payload(raw: &[u8], elem: ElemType, encoding: Encoding, out: &mut String) {
    match encoding {
        Encoding::Hex => {
            for byte in raw {
                let _ = write!(out, "{byte:02x}");
            }
        }
        Encoding::Base64 => {
            out.push_str(&BASE64.encode(raw));
        }
        Encoding::Text => {
            let w = elem.width();
            for (i, chunk) in raw.chunks_exact(w).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                format_scalar(chunk, elem, out);
            }
        }
    }
}

fn format_scalar(chunk: &[u8], elem: ElemType, out: &mut String) {
    macro_rules! fmt {
        ($t:ty) => {{
            const W: usize = std::mem::size_of::<$t>();
            let v = <$t>::from_le_bytes(chunk.try_into().unwrap_or([0; W]));
            let _ = write!(out, "{v}");
        }};
    }
    match elem {
        ElemType::I8 => fmt!(i8),
        ElemType::U8 => fmt!(u8),
        ElemType::I16 => fmt!(i16),
        ElemType::U16 => fmt!(u16),
        ElemType::I32 => fmt!(i32),
        ElemType::U32 => fmt!(u32),
        ElemType::I64 => fmt!(i64),
        ElemType::U64 => fmt!(u64),
        ElemType::F32 => fmt!(f32),
        ElemType::F64 => fmt!(f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::STATS_LEN;

    const IMAGE: usize = 16;

    fn history() -> SliceHistory {
        SliceHistory::new(IMAGE + STATS_LEN, IMAGE, 64)
    }

    /// Pushes a slice whose image starts with `head` bytes.
    fn push_slice(hist: &mut SliceHistory, head: &[u8]) -> u64 {
        let mut slice = vec![0u8; IMAGE + STATS_LEN];
        slice[..head.len()].copy_from_slice(head);
        let stats = TaskStats {
            seconds: 100,
            nanos: 250_000_000,
            ..TaskStats::default()
        };
        slice[IMAGE..IMAGE + STATS_LEN].copy_from_slice(&stats.to_bytes());
        hist.push(&slice)
    }

    fn channel(elem: ElemType, count: u32) -> ChannelDescriptor {
        ChannelDescriptor::vector(0, "/t/ch", 0, count, elem)
    }

    fn engine() -> StreamEngine {
        StreamEngine::new(EventPolicy::RisingEdge)
    }

    fn frames(out: &str) -> Vec<&str> {
        out.lines()
            .filter(|l| l.starts_with("<F") || l.starts_with("<E"))
            .collect()
    }

    fn payload_of(frame: &str) -> &str {
        let start = frame.find("d=\"").unwrap() + 3;
        let end = frame.rfind('"').unwrap();
        &frame[start..end]
    }

    #[test]
    fn text_frames_wrap_in_data_header() {
        let mut hist = history();
        let mut eng = engine();
        let ch = channel(ElemType::U32, 1);
        eng.subscribe(&ch, SubscriptionSpec::default()).unwrap();

        let seq = push_slice(&mut hist, &7u32.to_le_bytes());
        let mut out = String::new();
        eng.on_slice(&hist, seq, 25, &mut out);

        assert!(out.starts_with("<data level=\"25\" time=\"100.250000\">\n"));
        assert!(out.ends_with("</data>\n"));
        let frames = frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(payload_of(frames[0]), "7");
    }

    #[test]
    fn no_subscription_fires_no_header() {
        let mut hist = history();
        let mut eng = engine();
        let ch = channel(ElemType::U32, 1);
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                decimation: 4,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();

        let mut out = String::new();
        push_slice(&mut hist, &[0; 4]);
        let seq = push_slice(&mut hist, &[0; 4]);
        // seq 1 is not a multiple of 4: nothing at all is emitted.
        eng.on_slice(&hist, seq, 0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn decimated_blocks_gather_oldest_first() {
        let mut hist = history();
        let mut eng = engine();
        let ch = channel(ElemType::U8, 1);
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                decimation: 2,
                block: 3,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();

        // Slices 0..=6 hold values 10..=16; at seq 6 (a multiple of
        // dec*block = 6) the block gathers seqs 2, 4, 6.
        let mut out = String::new();
        for v in 0..=6u8 {
            let seq = push_slice(&mut hist, &[10 + v]);
            eng.on_slice(&hist, seq, 0, &mut out);
        }
        let all = frames(&out);
        // seq 0 lacks history for a full block; only seq 6 emits.
        assert_eq!(all.len(), 1);
        assert_eq!(payload_of(all[0]), "12,14,16");
    }

    #[test]
    fn event_fires_on_rising_edge_only() {
        let mut hist = history();
        let mut eng = engine();
        let ch = channel(ElemType::U32, 1);
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                event: true,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();

        let mut out = String::new();
        for v in [0u32, 5, 5, 0, 5] {
            let seq = push_slice(&mut hist, &v.to_le_bytes());
            eng.on_slice(&hist, seq, 0, &mut out);
        }

        // 0→5 fires, 5→5 quiet, 5→0 quiet (fall), 0→5 fires again.
        let all = frames(&out);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|f| f.starts_with("<E")));
        assert_eq!(payload_of(all[0]), "5");
        assert_eq!(payload_of(all[1]), "5");
    }

    #[test]
    fn any_change_policy_also_reports_falls() {
        let mut hist = history();
        let mut eng = StreamEngine::new(EventPolicy::AnyChange);
        let ch = channel(ElemType::U32, 1);
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                event: true,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();

        let mut out = String::new();
        for v in [0u32, 5, 5, 0, 5] {
            let seq = push_slice(&mut hist, &v.to_le_bytes());
            eng.on_slice(&hist, seq, 0, &mut out);
        }
        assert_eq!(frames(&out).len(), 3);
    }

    #[test]
    fn base64_payload_round_trips_across_widths_and_decimations() {
        for elem in [ElemType::U8, ElemType::U16, ElemType::U32, ElemType::U64] {
            for dec in [1u32, 3, 7] {
                let mut hist = history();
                let mut eng = engine();
                let ch = channel(elem, 1);
                eng.subscribe(
                    &ch,
                    SubscriptionSpec {
                        decimation: dec,
                        block: 2,
                        encoding: Encoding::Base64,
                        ..SubscriptionSpec::default()
                    },
                )
                .unwrap();

                let w = elem.width();
                let mut out = String::new();
                let total = 2 * dec as usize;
                for v in 0..=total {
                    let mut head = vec![0u8; w];
                    head[0] = v as u8;
                    let seq = push_slice(&mut hist, &head);
                    eng.on_slice(&hist, seq, 0, &mut out);
                }

                // The emit at seq = dec*block gathers seqs dec and 2*dec.
                let all = frames(&out);
                assert!(!all.is_empty(), "{elem:?} dec {dec} emitted nothing");
                let decoded = BASE64.decode(payload_of(all[0])).unwrap();
                assert_eq!(decoded.len(), 2 * w, "raw byte count, not elements");
                assert_eq!(decoded[0], dec as u8);
                assert_eq!(decoded[w], 2 * dec as u8);
            }
        }
    }

    #[test]
    fn hex_is_lowercase_bytes() {
        let mut hist = history();
        let mut eng = engine();
        let ch = channel(ElemType::U16, 1);
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                encoding: Encoding::Hex,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();

        let seq = push_slice(&mut hist, &0xBEEFu16.to_le_bytes());
        let mut out = String::new();
        eng.on_slice(&hist, seq, 0, &mut out);
        assert_eq!(payload_of(frames(&out)[0]), "efbe");
    }

    #[test]
    fn delta_compresses_signed_blocks_back_to_front() {
        let mut hist = history();
        let mut eng = engine();
        let ch = channel(ElemType::I32, 1);
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                block: 4,
                delta: true,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();

        let mut out = String::new();
        for v in [100i32, 110, 95, 130, 131] {
            let seq = push_slice(&mut hist, &v.to_le_bytes());
            eng.on_slice(&hist, seq, 0, &mut out);
        }
        // Emit at seq 4 gathers 110,95,130,131; first value absolute,
        // successors as differences.
        let all = frames(&out);
        assert_eq!(all.len(), 1);
        assert_eq!(payload_of(all[0]), "110,-15,35,1");
    }

    #[test]
    fn delta_is_disabled_for_unsigned_channels() {
        let mut hist = history();
        let mut eng = engine();
        let ch = channel(ElemType::U8, 1);
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                block: 3,
                delta: true,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();

        let mut out = String::new();
        for v in [10u8, 30, 20, 40] {
            let seq = push_slice(&mut hist, &[v]);
            eng.on_slice(&hist, seq, 0, &mut out);
        }
        // Values pass through absolute: a delta would have printed 30,-10,20.
        let all = frames(&out);
        assert_eq!(payload_of(all[0]), "30,20,40");
    }

    #[test]
    fn resubscribing_replaces_and_stop_removes() {
        let mut eng = engine();
        let ch = channel(ElemType::U8, 1);
        eng.subscribe(&ch, SubscriptionSpec::default()).unwrap();
        eng.subscribe(
            &ch,
            SubscriptionSpec {
                decimation: 5,
                ..SubscriptionSpec::default()
            },
        )
        .unwrap();
        assert_eq!(eng.subscription_count(), 1);
        assert!(eng.unsubscribe(0));
        assert!(!eng.unsubscribe(0));
    }

    #[test]
    fn history_retains_only_capacity_slices() {
        let mut hist = SliceHistory::new(IMAGE + STATS_LEN, IMAGE, 4);
        for v in 0..6u8 {
            push_slice_into(&mut hist, &[v]);
        }
        assert!(hist.slice(0).is_none());
        assert!(hist.slice(1).is_none());
        assert!(hist.slice(2).is_some());
        assert!(hist.slice(5).is_some());
        assert!(hist.slice(6).is_none());
    }

    fn push_slice_into(hist: &mut SliceHistory, head: &[u8]) -> u64 {
        let mut slice = vec![0u8; IMAGE + STATS_LEN];
        slice[..head.len()].copy_from_slice(head);
        hist.push(&slice)
    }
}
