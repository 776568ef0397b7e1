//! Pattern events and zero-copy views into engine-owned arrays.
//!
//! A pattern is a `lines x tracks` grid of 8-byte event records, line-major:
//! the record for `(track, line)` sits at index `line * tracks + track`.
//!
//! ```text
//! byte  0    1    2    3    4    5    6    7
//!       NN   VV   MM   MM   EE   CC   YY   XX
//!       note vel  module    ctl       ctl_val
//! ```
//!
//! Views borrow the [`Bridge`](crate::Bridge) that produced them, so no
//! other engine call can run while a view is alive.

use crate::flags::NoteCmd;

/// Size of one event record in bytes.
pub const EVENT_BYTES: usize = 8;

/// One pattern event, bit-exact with the engine's note struct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventRecord {
    /// 0 nothing, 1..=127 note number, 128+ command ([`NoteCmd`])
    pub note: u8,
    /// 0 default, 1..=129 velocity
    pub velocity: u8,
    /// 0 nothing, otherwise module number + 1
    pub module: u16,
    /// 0xCCEE: controller number (CC) and effect (EE)
    pub ctl: u16,
    /// 0xXXYY: controller value or effect parameter
    pub ctl_val: u16,
}

impl EventRecord {
    /// A note for module `module` (module number, not +1).
    pub fn note_on(note: u8, velocity: u8, module: u16) -> Self {
        Self {
            note,
            velocity,
            module: module.wrapping_add(1),
            ..Self::default()
        }
    }

    /// A note command.
    pub fn command(cmd: NoteCmd) -> Self {
        Self {
            note: cmd.value(),
            ..Self::default()
        }
    }

    /// Encode as `NN VV MM MM EE CC YY XX`.
    pub fn to_bytes(&self) -> [u8; EVENT_BYTES] {
        let m = self.module.to_le_bytes();
        let c = self.ctl.to_le_bytes();
        let v = self.ctl_val.to_le_bytes();
        [self.note, self.velocity, m[0], m[1], c[0], c[1], v[0], v[1]]
    }

    /// Decode one record.
    pub fn from_bytes(b: &[u8; EVENT_BYTES]) -> Self {
        Self {
            note: b[0],
            velocity: b[1],
            module: u16::from_le_bytes([b[2], b[3]]),
            ctl: u16::from_le_bytes([b[4], b[5]]),
            ctl_val: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    /// Decode the first record of `bytes`, if long enough.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let b: &[u8; EVENT_BYTES] = bytes.get(..EVENT_BYTES)?.try_into().ok()?;
        Some(Self::from_bytes(b))
    }

    /// True if every field is zero.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The note command, if `note` holds one.
    pub fn note_cmd(&self) -> Option<NoteCmd> {
        NoteCmd::from_note(self.note)
    }

    /// Target module number, if any.
    pub fn module_index(&self) -> Option<u16> {
        self.module.checked_sub(1)
    }

    /// Controller number (CC)
    pub fn controller(&self) -> u8 {
        (self.ctl >> 8) as u8
    }

    /// Effect code (EE)
    pub fn effect(&self) -> u8 {
        (self.ctl & 0xFF) as u8
    }
}

/// Partial update for `sv_set_pattern_event`. `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventPatch {
    /// Note
    pub note: Option<u8>,
    /// Velocity
    pub velocity: Option<u8>,
    /// Module (+1)
    pub module: Option<u16>,
    /// 0xCCEE
    pub ctl: Option<u16>,
    /// 0xXXYY
    pub ctl_val: Option<u16>,
}

impl EventPatch {
    /// Entry-point arguments, `-1` for fields left unchanged.
    pub fn to_args(&self) -> [i32; 5] {
        fn field<T: Into<i32>>(v: Option<T>) -> i32 {
            v.map_or(-1, Into::into)
        }
        [
            field(self.note),
            field(self.velocity),
            field(self.module),
            field(self.ctl),
            field(self.ctl_val),
        ]
    }
}

impl From<EventRecord> for EventPatch {
    fn from(e: EventRecord) -> Self {
        Self {
            note: Some(e.note),
            velocity: Some(e.velocity),
            module: Some(e.module),
            ctl: Some(e.ctl),
            ctl_val: Some(e.ctl_val),
        }
    }
}

/// Read-only view of a pattern's event grid in foreign memory.
#[derive(Debug, Clone, Copy)]
pub struct PatternView<'a> {
    bytes: &'a [u8],
    tracks: usize,
    lines: usize,
}

impl<'a> PatternView<'a> {
    pub(crate) fn new(bytes: &'a [u8], tracks: usize, lines: usize) -> Self {
        Self { bytes, tracks, lines }
    }

    /// A view with no events.
    pub fn empty() -> Self {
        Self {
            bytes: &[],
            tracks: 0,
            lines: 0,
        }
    }

    /// Track count
    pub fn tracks(&self) -> usize {
        self.tracks
    }

    /// Line count
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Number of event records
    pub fn len(&self) -> usize {
        self.tracks * self.lines
    }

    /// True for a zero-sized pattern
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw grid, `len() * EVENT_BYTES` bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Decode the event at `(track, line)`.
    pub fn event(&self, track: usize, line: usize) -> Option<EventRecord> {
        if track >= self.tracks || line >= self.lines {
            return None;
        }
        let at = (line * self.tracks + track) * EVENT_BYTES;
        EventRecord::from_slice(&self.bytes[at..])
    }

    /// All events of one line, in track order.
    pub fn line(&self, line: usize) -> impl Iterator<Item = EventRecord> + 'a {
        let bytes: &'a [u8] = self.bytes;
        let row: &'a [u8] = if line < self.lines {
            let start = line * self.tracks * EVENT_BYTES;
            &bytes[start..start + self.tracks * EVENT_BYTES]
        } else {
            &[]
        };
        row.chunks_exact(EVENT_BYTES).filter_map(EventRecord::from_slice)
    }

    /// Every non-empty event as `(track, line, event)`.
    pub fn events(&self) -> impl Iterator<Item = (usize, usize, EventRecord)> + 'a {
        let tracks = self.tracks.max(1);
        let bytes: &'a [u8] = self.bytes;
        bytes
            .chunks_exact(EVENT_BYTES)
            .enumerate()
            .filter_map(move |(i, chunk)| {
                let event = EventRecord::from_slice(chunk)?;
                (!event.is_empty()).then_some((i % tracks, i / tracks, event))
            })
    }
}

/// Read-only view of a module's input or output link array.
///
/// Entries are module numbers; `-1` marks an empty link slot.
#[derive(Debug, Clone, Copy)]
pub struct LinkView<'a> {
    bytes: &'a [u8],
}

impl<'a> LinkView<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// A view with no links.
    pub fn empty() -> Self {
        Self { bytes: &[] }
    }

    /// Number of link slots
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    /// True if there are no link slots
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Link slot `i`
    pub fn get(&self, i: usize) -> Option<i32> {
        let c = self.bytes.get(i * 4..i * 4 + 4)?;
        Some(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Linked module numbers, skipping empty slots.
    pub fn iter(&self) -> impl Iterator<Item = i32> + 'a {
        let bytes: &'a [u8] = self.bytes;
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .filter(|&m| m >= 0)
    }

    /// Copy the linked module numbers.
    pub fn to_vec(&self) -> Vec<i32> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_byte_layout() {
        let e = EventRecord {
            note: 0x3D,
            velocity: 0x40,
            module: 0x0002,
            ctl: 0x0201,
            ctl_val: 0x8000,
        };
        assert_eq!(e.to_bytes(), [0x3D, 0x40, 0x02, 0x00, 0x01, 0x02, 0x00, 0x80]);
        assert_eq!(EventRecord::from_bytes(&e.to_bytes()), e);
        assert_eq!(e.controller(), 0x02);
        assert_eq!(e.effect(), 0x01);
        assert_eq!(e.module_index(), Some(1));
    }

    #[test]
    fn test_note_helpers() {
        let e = EventRecord::note_on(60, 129, 3);
        assert_eq!(e.module, 4);
        assert_eq!(e.note_cmd(), None);
        let off = EventRecord::command(NoteCmd::NoteOff);
        assert_eq!(off.note, 128);
        assert_eq!(off.note_cmd(), Some(NoteCmd::NoteOff));
        assert_eq!(off.module_index(), None);
    }

    #[test]
    fn test_patch_args() {
        let patch = EventPatch {
            note: Some(61),
            ctl_val: Some(0xFFFF),
            ..EventPatch::default()
        };
        assert_eq!(patch.to_args(), [61, -1, -1, -1, 0xFFFF]);
        let full = EventPatch::from(EventRecord::note_on(1, 2, 0));
        assert_eq!(full.to_args(), [1, 2, 1, 0, 0]);
    }

    #[test]
    fn test_view_is_line_major() {
        // 2 tracks x 3 lines
        let mut grid = vec![0u8; 2 * 3 * EVENT_BYTES];
        let e = EventRecord::note_on(72, 0, 5);
        let at = (2 * 2 + 1) * EVENT_BYTES;
        grid[at..at + EVENT_BYTES].copy_from_slice(&e.to_bytes());

        let view = PatternView::new(&grid, 2, 3);
        assert_eq!(view.len(), 6);
        assert_eq!(view.event(1, 2), Some(e));
        assert_eq!(view.event(0, 2).map(|e| e.is_empty()), Some(true));
        assert_eq!(view.event(2, 0), None);
        assert_eq!(view.event(0, 3), None);
        assert_eq!(view.line(2).collect::<Vec<_>>(), vec![EventRecord::default(), e]);
        assert_eq!(view.events().collect::<Vec<_>>(), vec![(1, 2, e)]);
    }

    #[test]
    fn test_empty_views() {
        let view = PatternView::empty();
        assert!(view.is_empty());
        assert_eq!(view.events().count(), 0);
        assert_eq!(view.line(0).count(), 0);
        assert!(LinkView::empty().is_empty());
    }

    #[test]
    fn test_link_view_skips_empty_slots() {
        let bytes: Vec<u8> = [3i32, -1, 0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let links = LinkView::new(&bytes);
        assert_eq!(links.len(), 3);
        assert_eq!(links.get(1), Some(-1));
        assert_eq!(links.to_vec(), vec![3, 0]);
    }
}
