//! Data model for a parsed score on its way to engraving.
//!
//! These structures are the hand-off format on both sides of the pipeline:
//! a front end fills them in, the pipeline turns them into a locked
//! [`ScoreGraph`](crate::graph::ScoreGraph) and back, and a back end reads
//! the finished result.  Time is measured in quarter notes as exact
//! rationals.

use std::collections::BTreeSet;
use std::fmt;

use num_rational::Ratio;
use serde::{Deserialize, Serialize};

/// Score time in quarter notes.
pub type Time = Ratio<i64>;

/// Shorthand for an exact time value `numer / denom` quarter notes.
pub fn time(numer: i64, denom: i64) -> Time {
    Time::new(numer, denom)
}

/// A complete score: parts, and metaparts grouping them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Title of the piece
    #[serde(default)]
    pub title: Option<String>,
    /// Parts (instruments), in score order
    pub parts: Vec<Part>,
    /// Part groups (e.g. a piano's two hands, a string section)
    #[serde(default)]
    pub metaparts: Vec<Metapart>,
}

/// One instrument part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    /// Part identifier (e.g. "P1")
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Ordered, contiguous measures
    pub measures: Vec<Measure>,
    /// Notes, rests and marks of every voice
    #[serde(default)]
    pub events: Vec<Event>,
    /// Voices used by this part (derived by the part-grouping pass)
    #[serde(default)]
    pub voices: BTreeSet<u32>,
}

/// A group of parts.  Holds part ids only; it never owns their events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metapart {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Ids of the child parts
    pub parts: Vec<String>,
    /// Union of the children's voices (derived)
    #[serde(default)]
    pub voices: BTreeSet<u32>,
}

/// Part-level data that lives under its own lock in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartInfo {
    pub id: String,
    pub name: Option<String>,
    pub voices: BTreeSet<u32>,
}

/// A single measure (bar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Start time (inclusive)
    pub start: Time,
    /// End time (exclusive)
    pub end: Time,
    /// Divisions per quarter note used by the source file
    #[serde(default = "default_divisions")]
    pub divisions: u32,
    /// Key signature requested by the input, if any
    #[serde(default)]
    pub key_request: Option<KeySig>,
    /// Key signature in effect (derived)
    #[serde(default)]
    pub key: Option<KeySig>,
    /// Barline requested at the left edge
    #[serde(default)]
    pub left_barline: Option<Barline>,
    /// Barline requested at the right edge
    #[serde(default)]
    pub right_barline: Option<Barline>,
    /// Barline actually drawn at the right edge (derived)
    #[serde(default)]
    pub barline: Option<Barline>,
    /// Where the measure came from in the input
    #[serde(default)]
    pub pos: FilePos,
}

fn default_divisions() -> u32 {
    1
}

/// Position of an object in the front end's input, for error reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilePos {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub col: u32,
}

impl fmt::Display for FilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{}:{}", self.line, self.col),
            None => write!(f, "{}:{}", self.line, self.col),
        }
    }
}

/// Stable identity of an event inside one score instance.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an event sounds like.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sound {
    /// MIDI note number; fractional values are microtones (60 = middle C)
    Pitch(Time),
    /// Named percussion instrument
    Percussion(String),
}

/// The closed set of event variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Note { sound: Sound },
    Rest,
    /// Carries marks only; takes up no time of its own
    Mark,
}

/// Why an event exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    #[default]
    Input,
    /// Piece of an input event cut by a pass (ties, tremolo, pruning)
    Split,
    /// Inserted to fill a hole
    Filler,
}

/// Values derived by passes.  Cleared when the event is changed
/// structurally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCache {
    #[serde(default)]
    pub staff: Option<u32>,
    #[serde(default)]
    pub beam: Option<u32>,
    /// Spanners this event lies under
    #[serde(default)]
    pub spanners: Vec<SpannerRef>,
}

impl EventCache {
    pub fn is_empty(&self) -> bool {
        self.staff.is_none() && self.beam.is_none() && self.spanners.is_empty()
    }
}

/// A note, rest or mark event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the graph; input values are replaced
    #[serde(default)]
    pub id: EventId,
    pub kind: EventKind,
    pub offset: Time,
    /// Position among grace notes sharing `offset`; `None` for main notes
    #[serde(default)]
    pub grace: Option<Time>,
    pub duration: Time,
    #[serde(default)]
    pub dynamic: Option<Time>,
    /// Candidate voices; the lowest one is the lane the event lives in
    #[serde(default)]
    pub voices: BTreeSet<u32>,
    #[serde(default)]
    pub marks: Vec<Mark>,
    #[serde(default)]
    pub pos: FilePos,
    #[serde(default = "default_valid")]
    pub valid: bool,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub cache: EventCache,
}

fn default_valid() -> bool {
    true
}

/// Kinds of spanner marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Spanner {
    Slur,
    Wedge,
    Glissando,
    Octave,
    Trill,
    Text,
}

impl Spanner {
    /// Whether one spanner may end on the same event the next one of the
    /// same kind and id begins on.
    pub fn can_touch(self) -> bool {
        matches!(self, Spanner::Slur | Spanner::Wedge | Spanner::Glissando)
    }

    /// Whether a spanner may begin and end on a single event.
    pub fn can_span_one(self) -> bool {
        matches!(
            self,
            Spanner::Wedge | Spanner::Octave | Spanner::Trill | Spanner::Text
        )
    }

    /// Paired endpoints that are allowed to overlap in time.
    pub fn is_paired(self) -> bool {
        matches!(self, Spanner::Glissando)
    }
}

impl fmt::Display for Spanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Spanner::Slur => "slur",
            Spanner::Wedge => "wedge",
            Spanner::Glissando => "glissando",
            Spanner::Octave => "octave",
            Spanner::Trill => "trill",
            Spanner::Text => "text spanner",
        };
        f.write_str(name)
    }
}

/// A spanner identity: kind plus the id that matches begins with ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpannerRef {
    pub kind: Spanner,
    pub id: u32,
}

/// Kinds of marks attached to events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkKind {
    Begin(Spanner),
    End(Spanner),
    /// Single-note tremolo; `count` is the note value of each stroke
    Tremolo { count: u32 },
    /// Alternating tremolo between two simultaneous notes
    DoubleTremolo { count: u32 },
    /// Tied from the previous event
    TieLeft,
    /// Tied to the next event
    TieRight,
    Articulation(String),
    Text(String),
}

/// A mark on an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mark {
    pub kind: MarkKind,
    /// Matches spanner begins with ends; unused by other kinds
    #[serde(default)]
    pub id: u32,
}

impl Mark {
    pub fn new(kind: MarkKind) -> Self {
        Self { kind, id: 0 }
    }

    pub fn begin(kind: Spanner, id: u32) -> Self {
        Self { kind: MarkKind::Begin(kind), id }
    }

    pub fn end(kind: Spanner, id: u32) -> Self {
        Self { kind: MarkKind::End(kind), id }
    }

    /// The spanner this mark begins, if any.
    pub fn begins(&self) -> Option<SpannerRef> {
        match self.kind {
            MarkKind::Begin(kind) => Some(SpannerRef { kind, id: self.id }),
            _ => None,
        }
    }

    /// The spanner this mark ends, if any.
    pub fn ends(&self) -> Option<SpannerRef> {
        match self.kind {
            MarkKind::End(kind) => Some(SpannerRef { kind, id: self.id }),
            _ => None,
        }
    }

    pub fn is_tie(&self) -> bool {
        matches!(self.kind, MarkKind::TieLeft | MarkKind::TieRight)
    }

    pub fn is_tremolo(&self) -> bool {
        matches!(
            self.kind,
            MarkKind::Tremolo { .. } | MarkKind::DoubleTremolo { .. }
        )
    }
}

/// Barline codes, in ascending strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Barline {
    Normal,
    Dotted,
    Dashed,
    Double,
    /// Heavy-light, opening a section
    Initial,
    /// Light-heavy, closing a section
    Final,
    /// Heavy-light-heavy: a final immediately followed by an initial
    InitFinal,
    RepeatLeft,
    RepeatRight,
    RepeatBoth,
}

impl Barline {
    /// Numeric strength used when two requests meet at one barline.
    pub fn strength(self) -> u8 {
        self as u8
    }
}

/// Key mode.  Only affects naming; both modes share a signature's scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Major,
    Minor,
}

/// Key signature as a count of sharps (positive) or flats (negative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySig {
    pub fifths: i8,
    #[serde(default)]
    pub mode: Mode,
}

/// Semitone offsets of the major scale.
const MAJOR_SCALE: [i64; 7] = [0, 2, 4, 5, 7, 9, 11];

impl KeySig {
    pub fn major(fifths: i8) -> Self {
        Self {
            fifths,
            mode: Mode::Major,
        }
    }

    /// Whether a pitch class (0 = C) is diatonic in this signature.
    pub fn contains(&self, pitch_class: i64) -> bool {
        let tonic = (i64::from(self.fifths) * 7).rem_euclid(12);
        MAJOR_SCALE
            .iter()
            .any(|step| (tonic + step) % 12 == pitch_class.rem_euclid(12))
    }
}

// ─── Capabilities ────────────────────────────────────────────────────

/// Objects occupying a time span.
pub trait HasTime {
    fn offset(&self) -> Time;
    fn duration(&self) -> Time;

    fn end(&self) -> Time {
        self.offset() + self.duration()
    }

    /// Whether the half-open spans intersect.
    fn overlaps<O: HasTime + ?Sized>(&self, other: &O) -> bool {
        self.offset() < other.end() && other.offset() < self.end()
    }
}

/// Objects assigned to voices.
pub trait HasVoice {
    fn voices(&self) -> &BTreeSet<u32>;

    /// The voice lane the object lives in.
    fn primary_voice(&self) -> u32 {
        self.voices().iter().next().copied().unwrap_or(1)
    }
}

/// Objects carrying marks.
pub trait HasMarks {
    fn marks(&self) -> &[Mark];

    fn spanner_begins(&self) -> Vec<SpannerRef> {
        self.marks().iter().filter_map(Mark::begins).collect()
    }

    fn spanner_ends(&self) -> Vec<SpannerRef> {
        self.marks().iter().filter_map(Mark::ends).collect()
    }

    fn has_spanner_marks(&self) -> bool {
        self.marks()
            .iter()
            .any(|m| m.begins().is_some() || m.ends().is_some())
    }
}

impl HasTime for Event {
    fn offset(&self) -> Time {
        self.offset
    }

    fn duration(&self) -> Time {
        self.duration
    }
}

impl HasVoice for Event {
    fn voices(&self) -> &BTreeSet<u32> {
        &self.voices
    }
}

impl HasMarks for Event {
    fn marks(&self) -> &[Mark] {
        &self.marks
    }
}

impl HasTime for Measure {
    fn offset(&self) -> Time {
        self.start
    }

    fn duration(&self) -> Time {
        self.end - self.start
    }
}

// ─── Constructors and queries ────────────────────────────────────────

impl Event {
    fn with_kind(kind: EventKind, offset: Time, duration: Time) -> Self {
        Self {
            id: EventId::default(),
            kind,
            offset,
            grace: None,
            duration,
            dynamic: None,
            voices: BTreeSet::from([1]),
            marks: Vec::new(),
            pos: FilePos::default(),
            valid: true,
            origin: Origin::Input,
            cache: EventCache::default(),
        }
    }

    /// A pitched note in voice 1.
    pub fn note(offset: Time, duration: Time, pitch: i64) -> Self {
        Self::with_kind(
            EventKind::Note {
                sound: Sound::Pitch(Time::from_integer(pitch)),
            },
            offset,
            duration,
        )
    }

    /// A rest in voice 1.
    pub fn rest(offset: Time, duration: Time) -> Self {
        Self::with_kind(EventKind::Rest, offset, duration)
    }

    /// A mark-only event in voice 1.
    pub fn mark(offset: Time, marks: Vec<Mark>) -> Self {
        let mut event = Self::with_kind(EventKind::Mark, offset, Time::from_integer(0));
        event.marks = marks;
        event
    }

    /// Replace the candidate voices with a single voice.
    pub fn in_voice(mut self, voice: u32) -> Self {
        self.voices = BTreeSet::from([voice]);
        self
    }

    pub fn with_mark(mut self, mark: Mark) -> Self {
        self.marks.push(mark);
        self
    }

    pub fn with_grace(mut self, grace: Time) -> Self {
        self.grace = Some(grace);
        self
    }

    pub fn at(mut self, line: u32, col: u32) -> Self {
        self.pos = FilePos {
            file: None,
            line,
            col,
        };
        self
    }

    pub fn is_note(&self) -> bool {
        matches!(self.kind, EventKind::Note { .. })
    }

    pub fn is_rest(&self) -> bool {
        matches!(self.kind, EventKind::Rest)
    }

    pub fn is_grace(&self) -> bool {
        self.grace.is_some()
    }

    pub fn sound(&self) -> Option<&Sound> {
        match &self.kind {
            EventKind::Note { sound } => Some(sound),
            _ => None,
        }
    }

    /// MIDI pitch, for pitched notes.
    pub fn pitch(&self) -> Option<Time> {
        match self.sound() {
            Some(Sound::Pitch(p)) => Some(*p),
            _ => None,
        }
    }

    /// Whether the event takes up time in its voice.  Grace and mark events
    /// do not.
    pub fn occupies_time(&self) -> bool {
        !matches!(self.kind, EventKind::Mark) && self.grace.is_none()
    }

    /// Sort key giving the iteration order inside a lane: grace notes come
    /// before the main note at the same offset.
    pub fn time_key(&self) -> (Time, bool, Time) {
        (
            self.offset,
            self.grace.is_none(),
            self.grace.unwrap_or_else(|| Time::from_integer(0)),
        )
    }
}

impl Measure {
    pub fn new(start: Time, end: Time) -> Self {
        Self {
            start,
            end,
            divisions: default_divisions(),
            key_request: None,
            key: None,
            left_barline: None,
            right_barline: None,
            barline: None,
            pos: FilePos::default(),
        }
    }

    pub fn with_key(mut self, key: KeySig) -> Self {
        self.key_request = Some(key);
        self
    }

    pub fn with_barlines(mut self, left: Option<Barline>, right: Option<Barline>) -> Self {
        self.left_barline = left;
        self.right_barline = right;
        self
    }

    /// Whether `at` falls inside `[start, end)`.
    pub fn contains(&self, at: Time) -> bool {
        self.start <= at && at < self.end
    }
}

impl Part {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            measures: Vec::new(),
            events: Vec::new(),
            voices: BTreeSet::new(),
        }
    }

    /// A part with `count` back-to-back measures of `length` quarters.
    pub fn with_meter(id: &str, count: usize, length: Time) -> Self {
        let mut part = Self::new(id);
        let mut start = Time::from_integer(0);
        for _ in 0..count {
            part.measures.push(Measure::new(start, start + length));
            start += length;
        }
        part
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    /// End of the last measure.
    pub fn end(&self) -> Option<Time> {
        self.measures.last().map(|m| m.end)
    }
}

impl Score {
    /// Create a new empty score.
    pub fn new() -> Self {
        Self {
            title: None,
            parts: Vec::new(),
            metaparts: Vec::new(),
        }
    }

    /// Get the number of measures of the first part.
    pub fn measure_count(&self) -> usize {
        self.parts.first().map_or(0, |p| p.measures.len())
    }

    /// Number of events across all parts.
    pub fn event_count(&self) -> usize {
        self.parts.iter().map(|p| p.events.len()).sum()
    }
}

impl Default for Score {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_notes_sort_before_main_note() {
        let main = Event::note(time(1, 1), time(1, 1), 60);
        let grace = Event::note(time(1, 1), time(1, 4), 62).with_grace(time(1, 2));
        assert!(grace.time_key() < main.time_key());
    }

    #[test]
    fn key_signature_scales() {
        let c = KeySig::major(0);
        assert!(c.contains(0) && c.contains(11) && !c.contains(1));
        let d = KeySig::major(2);
        assert!(d.contains(6) && d.contains(1) && !d.contains(5));
        let f = KeySig::major(-1);
        assert!(f.contains(10) && !f.contains(11));
    }

    #[test]
    fn spans_overlap_half_open() {
        let a = Event::note(time(0, 1), time(2, 1), 60);
        let b = Event::note(time(2, 1), time(1, 1), 60);
        let c = Event::note(time(1, 1), time(1, 1), 60);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn primary_voice_defaults_to_one() {
        let mut e = Event::rest(time(0, 1), time(1, 1));
        e.voices.clear();
        assert_eq!(e.primary_voice(), 1);
        assert_eq!(e.in_voice(3).primary_voice(), 3);
    }
}
