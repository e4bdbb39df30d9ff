// This is a library for streaming groundwater monitoring lines out of delimited tile files.
//
// A tile is one partition of a large export: a header record followed by one record per
// feature. Feature records carry a WKT MULTILINESTRING (or LINESTRING) in a projected
// reference system, usually UTM-style metres, plus a scalar attribute such as the elevation
// level ("kote"). Records are cleaned, decoded, reprojected to latitude/longitude and handed
// out as bounded batches of render commands to whatever consumer is plugged in as a
// CommandSink.
//
// Per tile, data moves strictly downward:
//
//   Orchestrator -> TileReader -> sanitize() -> decode_wkt() -> Reprojector -> BatchEmitter
//
// Nothing past configuration is fatal. A bad record is dropped with a Diagnostic, a tile that
// can't be read is closed with its failure recorded, and the run moves on to the next tile.
//
// References:
//   WKT: https://www.ogc.org/standard/sfa/ (Simple Features, part 1, section 7)
//   PROJ.4 strings: https://proj.org/usage/quickstart.html

use itertools::Itertools;
use lazy_static::lazy_static;
use log::{debug, info, trace, warn};
use proj4rs::proj::Proj;
use regex::Regex;
use simple_error::{bail, SimpleError};
use std::error::Error;
use std::fmt;
use std::fs;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Number of render commands per batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Delay between finishing one tile and starting the next unless configured otherwise.
pub const DEFAULT_PACING: Duration = Duration::from_millis(150);

/// Records per tile written by the splitter unless configured otherwise.
pub const DEFAULT_RECORDS_PER_TILE: usize = 2000;

/// Longest literal quoted back in a diagnostic.
const MAX_LITERAL_IN_DIAGNOSTIC: usize = 120;

lazy_static! {
    static ref CONTROL_WHITESPACE: Regex = Regex::new(r"[\t\r\n\x0B\x0C]+").unwrap();
    static ref SPACE_RUNS: Regex = Regex::new(r" {2,}").unwrap();
    // Leftmost-first: MULTILINESTRING wins over the LINESTRING inside it.
    static ref GEOMETRY_KEYWORD: Regex = Regex::new(r"(?i)\b(?:MULTI)?LINESTRING\b").unwrap();
    // What follows a keyword that actually opens a geometry.
    static ref GEOMETRY_BODY: Regex = Regex::new(r"(?i)^\s*(?:(?:ZM|Z|M)\s*)?(?:\(|EMPTY\b)").unwrap();
}

/// A coordinate pair in the source reference system, as (x, y).
pub type SourcePoint = (f64, f64);

/// One strand of a multi-line geometry. Point order is the order in the literal.
pub type LineSegment = Vec<SourcePoint>;

/// A decoded line geometry, still in source coordinates.
///
/// An empty geometry is legal: `MULTILINESTRING EMPTY` decodes to no segments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedGeometry {
    pub segments: Vec<LineSegment>,
}

impl ParsedGeometry {
    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns whether there are no segments at all.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the total number of points across all segments.
    pub fn num_points(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }
}

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedPoint {
    pub lat: f64,
    pub lon: f64,
}

impl fmt::Display for ProjectedPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{},{}]", self.lat, self.lon)
    }
}

/// One drawable unit for the consumer.
///
/// The Display impl is the consumer's command protocol: one `addLine(...)` or
/// `addMarker(...)` call terminated by a semicolon.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCommand {
    /// One reprojected line segment and its scalar attribute.
    Line {
        points: Vec<ProjectedPoint>,
        attribute: f64,
    },
    /// One point feature (a well) with a pre-formatted label.
    Marker { point: ProjectedPoint, label: String },
}

impl RenderCommand {
    /// Returns the points this command draws.
    pub fn points(&self) -> &[ProjectedPoint] {
        match self {
            RenderCommand::Line { points, .. } => points,
            RenderCommand::Marker { point, .. } => std::slice::from_ref(point),
        }
    }
}

impl fmt::Display for RenderCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RenderCommand::Line { points, attribute } => {
                write!(f, "addLine([{}], {});", points.iter().join(","), attribute)
            }
            // Debug quoting of a str is a valid JS string literal (\u{..} escapes included).
            RenderCommand::Marker { point, label } => {
                write!(f, "addMarker({}, {}, {:?});", point.lat, point.lon, label)
            }
        }
    }
}

/// The unit of delivery to a CommandSink.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Ordinal of the tile the commands came from.
    pub tile: usize,
    /// Position of this batch within its tile, starting at 0.
    pub sequence: usize,
    pub commands: Vec<RenderCommand>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for command in &self.commands {
            writeln!(f, "{}", command)?;
        }
        Ok(())
    }
}

/// Normalizes raw geometry text into a literal the decoder can read.
///
/// Strips quote characters, turns runs of control whitespace into one space, collapses
/// repeated spaces, trims, then strips trailing commas and semicolons. Returns None when
/// nothing is left. Applying it to its own output changes nothing.
pub fn sanitize(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let unquoted = raw.replace('"', "");
    let spaced = CONTROL_WHITESPACE.replace_all(&unquoted, " ");
    let collapsed = SPACE_RUNS.replace_all(&spaced, " ");

    let mut s: &str = collapsed.trim();
    // Separators can alternate at the end (",;" and ";,"), so go until nothing changes.
    loop {
        let before = s.len();
        while let Some(rest) = s.strip_suffix(',') {
            s = rest.trim_end();
        }
        if let Some(rest) = s.strip_suffix(';') {
            s = rest.trim_end();
        }
        if s.len() == before {
            break;
        }
    }

    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}


/// Why a literal could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// No LINESTRING or MULTILINESTRING keyword in the literal.
    MissingKeyword,
    /// Parentheses are missing, unbalanced or in the wrong place.
    Structure(String),
    /// A coordinate pair is not made of finite numbers.
    Coordinate(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::MissingKeyword => write!(f, "no LINESTRING/MULTILINESTRING keyword"),
            DecodeError::Structure(msg) => write!(f, "malformed geometry: {}", msg),
            DecodeError::Coordinate(pair) => write!(f, "invalid coordinate pair {:?}", pair),
        }
    }
}

impl Error for DecodeError {}

/// A cursor over the text following the geometry keyword.
struct WktCursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> WktCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text: text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    /// Consumes `c` (after any whitespace) if it is next.
    fn eat(&mut self, c: char) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), DecodeError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(DecodeError::Structure(format!(
                "expected '{}' at {:?}",
                c,
                abbreviate(self.rest().trim_start(), 24)
            )))
        }
    }

    /// Consumes a whole word (case-insensitive) if it is next.
    fn eat_word(&mut self, word: &str) -> bool {
        self.skip_whitespace();
        let rest = self.rest();
        if rest.len() < word.len() || !rest.is_char_boundary(word.len()) {
            return false;
        }
        let (head, tail) = rest.split_at(word.len());
        let at_boundary = !tail.starts_with(|c: char| c.is_alphanumeric() || c == '_');
        if head.eq_ignore_ascii_case(word) && at_boundary {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    /// Returns the text up to the next ')' and moves past it.
    fn take_group(&mut self) -> Result<&'a str, DecodeError> {
        let rest = self.rest();
        match rest.find(|c: char| c == '(' || c == ')') {
            Some(i) if rest[i..].starts_with(')') => {
                self.pos += i + 1;
                Ok(&rest[..i])
            }
            Some(_) => Err(DecodeError::Structure(
                "nested parenthesis inside a coordinate list".to_string(),
            )),
            None => Err(DecodeError::Structure("unterminated coordinate list".to_string())),
        }
    }

    /// Reads an optional Z / M / ZM tag and returns the number of ordinates per point.
    fn dimension_tag(&mut self) -> usize {
        if self.eat_word("ZM") {
            4
        } else if self.eat_word("Z") || self.eat_word("M") {
            3
        } else {
            2
        }
    }
}

/// Parses one "x y" (or "x y z ..." when tagged) pair.
fn parse_pair(pair: &str, ordinates: usize) -> Result<SourcePoint, DecodeError> {
    let tokens: Vec<&str> = pair.split_whitespace().collect();
    if tokens.len() != ordinates {
        return Err(DecodeError::Coordinate(pair.trim().to_string()));
    }
    let parse = |s: &str| s.parse::<f64>().ok().filter(|v| v.is_finite());
    match (parse(tokens[0]), parse(tokens[1])) {
        (Some(x), Some(y)) if tokens[2..].iter().all(|&t| parse(t).is_some()) => Ok((x, y)),
        _ => Err(DecodeError::Coordinate(pair.trim().to_string())),
    }
}

/// Parses one parenthesized coordinate list (or EMPTY) into a segment.
fn parse_segment(cursor: &mut WktCursor, ordinates: usize) -> Result<LineSegment, DecodeError> {
    if cursor.eat_word("EMPTY") {
        return Ok(vec![]);
    }
    cursor.expect('(')?;
    let body = cursor.take_group()?;
    if body.trim().is_empty() {
        return Ok(vec![]);
    }
    body.split(',').map(|pair| parse_pair(pair, ordinates)).collect()
}

/// Ranks one keyword occurrence in `text`; lower is a likelier start of the geometry.
///
/// A keyword followed by a coordinate list, EMPTY or a dimension tag beats a bare word such
/// as a station called "Linestring survey", and MULTILINESTRING beats LINESTRING.
fn keyword_rank(text: &str, keyword: &regex::Match) -> u8 {
    let bare = !GEOMETRY_BODY.is_match(&text[keyword.end()..]);
    let single = keyword.as_str().len() == "LINESTRING".len();
    2 * (bare as u8) + (single as u8)
}

/// Every keyword occurrence in `text`, best ranked first. Ties keep text order.
fn keyword_candidates(text: &str) -> Vec<regex::Match<'_>> {
    GEOMETRY_KEYWORD
        .find_iter(text)
        .sorted_by_key(|m| keyword_rank(text, m))
        .collect()
}

/// Decodes a cleaned MULTILINESTRING or LINESTRING literal.
///
/// Everything before the keyword is ignored, as is anything after the parenthesis that closes
/// the geometry. A single bad pair fails the whole literal; nothing is partially accepted.
/// When the keyword appears more than once, each occurrence is tried in rank order and the
/// first that decodes wins; otherwise the error of the best ranked one is returned.
pub fn decode_wkt(literal: &str) -> Result<ParsedGeometry, DecodeError> {
    let mut first_error = None;
    for keyword in keyword_candidates(literal) {
        match decode_at(literal, &keyword) {
            Ok(geometry) => return Ok(geometry),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    Err(first_error.unwrap_or(DecodeError::MissingKeyword))
}

fn decode_at(literal: &str, keyword: &regex::Match) -> Result<ParsedGeometry, DecodeError> {
    let multi = keyword.as_str().len() > "LINESTRING".len();

    let mut cursor = WktCursor::new(&literal[keyword.end()..]);
    let ordinates = cursor.dimension_tag();
    if cursor.eat_word("EMPTY") {
        return Ok(ParsedGeometry::default());
    }

    let mut geometry = ParsedGeometry::default();
    if multi {
        cursor.expect('(')?;
        loop {
            geometry.segments.push(parse_segment(&mut cursor, ordinates)?);
            if !cursor.eat(',') {
                break;
            }
        }
        cursor.expect(')')?;
    } else {
        geometry.segments.push(parse_segment(&mut cursor, ordinates)?);
    }
    Ok(geometry)
}


/// Resolves a reference-system identifier to a PROJ.4 definition.
///
/// Accepts `EPSG:<code>`, a bare numeric code (looked up in the crs-definitions database) or
/// a literal PROJ.4 string starting with `+`.
pub fn proj_definition(identifier: &str) -> Result<String, Box<dyn Error>> {
    let id = identifier.trim();
    if id.starts_with('+') {
        return Ok(id.to_string());
    }
    let code = match id.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("EPSG:") => &id[5..],
        _ => id,
    };
    let code: u16 = match code.trim().parse() {
        Ok(code) => code,
        Err(_) => bail!("Unrecognized reference system identifier {:?}", identifier),
    };
    match crs_definitions::from_code(code) {
        Some(def) => Ok(def.proj4.to_string()),
        None => bail!("EPSG:{} is not in the crs-definitions database", code),
    }
}

fn is_geographic(definition: &str) -> bool {
    definition.contains("+proj=longlat") || definition.contains("+proj=latlong")
}

/// Transforms points from a fixed projected reference system to geographic lat/lon.
///
/// Built once from the two identifiers and immutable afterwards, so one instance can be
/// shared (e.g. behind an Arc) by any number of threads.
pub struct Reprojector {
    source: Proj,
    target: Proj,
    source_id: String,
    target_id: String,
    /// proj4rs wants radians for geographic input.
    source_is_geographic: bool,
}

impl fmt::Debug for Reprojector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reprojector")
            .field("source", &self.source_id)
            .field("target", &self.target_id)
            .finish()
    }
}

impl fmt::Display for Reprojector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.source_id, self.target_id)
    }
}

impl Reprojector {
    /// Builds the transform. The target must be a geographic (longitude/latitude) system.
    pub fn new(source: &str, target: &str) -> Result<Reprojector, Box<dyn Error>> {
        let source_def = proj_definition(source)?;
        let target_def = proj_definition(target)?;
        if !is_geographic(&target_def) {
            bail!("Destination reference system {} is not geographic: {}", target, target_def);
        }

        let source_proj = Proj::from_proj_string(&source_def).map_err(|e| {
            SimpleError::new(format!("Invalid source reference system {}: {:?}", source, e))
        })?;
        let target_proj = Proj::from_proj_string(&target_def).map_err(|e| {
            SimpleError::new(format!("Invalid destination reference system {}: {:?}", target, e))
        })?;
        debug!("Reprojecting {} [{}] to {} [{}]", source, source_def, target, target_def);

        Ok(Reprojector {
            source: source_proj,
            target: target_proj,
            source_id: source.trim().to_string(),
            target_id: target.trim().to_string(),
            source_is_geographic: is_geographic(&source_def),
        })
    }

    /// Transforms one (x, y) pair into a validated latitude/longitude.
    pub fn project(&self, x: f64, y: f64) -> Result<ProjectedPoint, SimpleError> {
        let mut point = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        proj4rs::transform::transform(&self.source, &self.target, &mut point).map_err(|e| {
            SimpleError::new(format!("Transform of ({}, {}) failed: {:?}", x, y, e))
        })?;

        let lon = point.0.to_degrees();
        let lat = point.1.to_degrees();
        if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return Err(SimpleError::new(format!(
                "({}, {}) projects outside the globe: lat={} lon={}",
                x, y, lat, lon
            )));
        }
        Ok(ProjectedPoint { lat: lat, lon: lon })
    }
}

#[cfg(test)]
mod reproject_tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn etrs89_utm32() -> Reprojector {
        Reprojector::new("EPSG:25832", "EPSG:4326").unwrap()
    }

    fn assert_close(p: ProjectedPoint, lat: f64, lon: f64) {
        assert!((p.lat - lat).abs() < EPS, "lat {} != {}", p.lat, lat);
        assert!((p.lon - lon).abs() < EPS, "lon {} != {}", p.lon, lon);
    }

    #[test]
    fn central_meridian() {
        let r = etrs89_utm32();
        // Zone 32 is centred on 9E; the false easting puts it at x=500000.
        assert_close(r.project(500000.0, 0.0).unwrap(), 0.0, 9.0);
        // Northing is 0.9996 times the GRS80 meridian arc to 50N.
        assert_close(r.project(500000.0, 5538630.7027).unwrap(), 50.0, 9.0);
    }

    #[test]
    fn off_meridian() {
        let r = etrs89_utm32();
        assert_close(r.project(562366.6302, 6206530.8108).unwrap(), 56.0, 10.0);
    }

    #[test]
    fn identifiers() {
        assert!(proj_definition("EPSG:25832").unwrap().contains("+proj=utm"));
        assert!(proj_definition("epsg:4326").unwrap().contains("+proj=longlat"));
        assert!(proj_definition("25832").unwrap().contains("+zone=32"));
        assert_eq!(proj_definition(" +proj=longlat +datum=WGS84 ").unwrap(), "+proj=longlat +datum=WGS84");
        assert!(proj_definition("EPSG:").is_err());
        assert!(proj_definition("UTM32").is_err());
        assert!(proj_definition("EPSG:99999999").is_err());
    }

    #[test]
    fn target_must_be_geographic() {
        assert!(Reprojector::new("EPSG:4326", "EPSG:25832").is_err());
        let r = Reprojector::new("EPSG:25832", "+proj=longlat +datum=WGS84 +no_defs").unwrap();
        assert_close(r.project(500000.0, 0.0).unwrap(), 0.0, 9.0);
    }

    #[test]
    fn geographic_source() {
        let r = Reprojector::new("EPSG:4326", "EPSG:4326").unwrap();
        assert_close(r.project(12.5, 55.75).unwrap(), 55.75, 12.5);
    }

    #[test]
    fn shared_between_threads() {
        let r = Arc::new(etrs89_utm32());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || r.project(500000.0, 5538630.7027).unwrap())
            })
            .collect();
        for h in handles {
            assert_close(h.join().unwrap(), 50.0, 9.0);
        }
    }
}

/// Where in a record the geometry literal lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralStrategy {
    /// The first field containing the geometry keyword, rejoined with every field after it.
    /// This copes with unquoted literals that were split on their own commas.
    Keyword,
    /// A fixed field index.
    Column(usize),
}

/// What kind of feature each record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// Monitoring lines: one `addLine` per decoded segment.
    Lines,
    /// Wells: projected coordinates in columns `x` and `y`, label text in column `label`.
    Wells { x: usize, y: usize, label: usize },
}

/// Everything that varies between deployments of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Identifier of the projected source reference system, e.g. `EPSG:25832`.
    pub source_crs: String,
    /// Identifier of the geographic destination reference system, e.g. `EPSG:4326`.
    pub target_crs: String,
    pub tile_dir: PathBuf,
    /// Tile file extension without the dot.
    pub extension: String,
    /// Render commands per batch.
    pub batch_size: usize,
    /// Delay between tiles.
    pub pacing: Duration,
    /// Index of the scalar attribute (elevation level) field.
    pub attribute_column: usize,
    pub delimiter: u8,
    pub literal: LiteralStrategy,
    pub features: FeatureKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_crs: String::from("EPSG:25832"),
            target_crs: String::from("EPSG:4326"),
            tile_dir: PathBuf::from("data/tiles"),
            extension: String::from("csv"),
            batch_size: DEFAULT_BATCH_SIZE,
            pacing: DEFAULT_PACING,
            attribute_column: 4,
            delimiter: b';',
            literal: LiteralStrategy::Keyword,
            features: FeatureKind::Lines,
        }
    }
}

impl PipelineConfig {
    /// Checks the options that can't be checked by their types.
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.batch_size == 0 {
            bail!("Batch size must be at least 1.");
        }
        if self.extension.is_empty() {
            bail!("Tile extension must not be empty.");
        }
        if !self.delimiter.is_ascii() || self.delimiter == b'"' {
            bail!("Invalid delimiter byte {:#04x}", self.delimiter);
        }
        Ok(())
    }

    /// Builds the transform for the configured reference-system pair.
    pub fn reprojector(&self) -> Result<Reprojector, Box<dyn Error>> {
        Reprojector::new(&self.source_crs, &self.target_crs)
    }
}

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No geometry literal in the record.
    NoLiteral,
    /// The literal didn't decode.
    Geometry,
    /// A point couldn't be reprojected.
    Projection,
    /// Well coordinates missing or not numeric.
    Coordinates,
    /// The record isn't valid UTF-8.
    Encoding,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            DropReason::NoLiteral => "no geometry literal",
            DropReason::Geometry => "invalid geometry",
            DropReason::Projection => "reprojection failed",
            DropReason::Coordinates => "invalid coordinates",
            DropReason::Encoding => "invalid encoding",
        };
        f.write_str(text)
    }
}

/// A note about one dropped record.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// 1-based line number in the tile file (0 if unknown).
    pub line: u64,
    pub reason: DropReason,
    pub detail: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}: {}", self.line, self.reason, self.detail)
    }
}

/// Shortens long text for log messages, respecting char boundaries.
fn abbreviate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

/// Parses the attribute field, falling back to 0 when it is missing or not a number.
fn parse_attribute(field: Option<&str>) -> f64 {
    field
        .and_then(|f| f.trim().trim_matches('"').trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Pulls the raw geometry text out of a record.
fn extract_literal(record: &csv::StringRecord, config: &PipelineConfig) -> Option<String> {
    match config.literal {
        LiteralStrategy::Keyword => {
            // Best ranked keyword wins; among equals the leftmost field.
            let (_, start) = record
                .iter()
                .enumerate()
                .filter_map(|(i, field)| {
                    let rank = GEOMETRY_KEYWORD.find_iter(field).map(|m| keyword_rank(field, &m)).min()?;
                    Some((rank, i))
                })
                .min()?;
            let delimiter = char::from(config.delimiter).to_string();
            Some(record.iter().skip(start).join(&delimiter))
        }
        LiteralStrategy::Column(i) => record.get(i).map(String::from),
    }
}

/// Turns one record into render commands, or says why it can't.
///
/// Lines yield one command per segment; wells yield exactly one marker.
pub fn commands_for_record(
    record: &csv::StringRecord,
    config: &PipelineConfig,
    reprojector: &Reprojector,
) -> Result<Vec<RenderCommand>, (DropReason, String)> {
    let attribute = parse_attribute(record.get(config.attribute_column));

    match config.features {
        FeatureKind::Lines => {
            let literal = extract_literal(record, config)
                .and_then(|raw| sanitize(&raw))
                .ok_or_else(|| {
                    let fields = record.iter().join("|");
                    (DropReason::NoLiteral, abbreviate(&fields, MAX_LITERAL_IN_DIAGNOSTIC))
                })?;
            let geometry = decode_wkt(&literal).map_err(|e| {
                let shown = abbreviate(&literal, MAX_LITERAL_IN_DIAGNOSTIC);
                (DropReason::Geometry, format!("{} in {}", e, shown))
            })?;

            let mut commands = Vec::with_capacity(geometry.len());
            for segment in &geometry.segments {
                let points = segment
                    .iter()
                    .map(|&(x, y)| reprojector.project(x, y))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| (DropReason::Projection, e.to_string()))?;
                commands.push(RenderCommand::Line {
                    points: points,
                    attribute: attribute,
                });
            }
            Ok(commands)
        }
        FeatureKind::Wells { x, y, label } => {
            let coordinate = |i: usize| {
                record
                    .get(i)
                    .and_then(|f| f.trim().trim_matches('"').trim().parse::<f64>().ok())
                    .filter(|v| v.is_finite())
            };
            let (x, y) = match (coordinate(x), coordinate(y)) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    return Err((
                        DropReason::Coordinates,
                        format!("{:?}, {:?}", record.get(x).unwrap_or(""), record.get(y).unwrap_or("")),
                    ))
                }
            };
            let point = reprojector
                .project(x, y)
                .map_err(|e| (DropReason::Projection, e.to_string()))?;
            let name = record.get(label).and_then(sanitize).unwrap_or_default();
            Ok(vec![RenderCommand::Marker {
                point: point,
                label: format!("{}: {}", name, attribute),
            }])
        }
    }
}

/// The south-west and north-east corners of everything emitted for a tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: ProjectedPoint,
    pub max: ProjectedPoint,
}

impl Bounds {
    fn extend(bounds: &mut Option<Bounds>, p: &ProjectedPoint) {
        match bounds {
            None => *bounds = Some(Bounds { min: *p, max: *p }),
            Some(b) => {
                b.min.lat = b.min.lat.min(p.lat);
                b.min.lon = b.min.lon.min(p.lon);
                b.max.lat = b.max.lat.max(p.lat);
                b.max.lon = b.max.lon.max(p.lon);
            }
        }
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} .. {}", self.min, self.max)
    }
}

/// One input file, ranked by its position in the sorted tile list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub ordinal: usize,
    pub path: PathBuf,
}

impl Tile {
    pub fn new<P: AsRef<Path>>(ordinal: usize, path: P) -> Tile {
        Tile {
            ordinal: ordinal,
            path: PathBuf::from(path.as_ref()),
        }
    }

    /// Returns the file name, for messages.
    pub fn name(&self) -> String {
        match self.path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.path.display().to_string(),
        }
    }
}

/// Lifecycle of a tile. Closed is terminal, on success and failure alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Discovered,
    Opened,
    Streaming,
    Flushed,
    Closed,
}

/// What happened to one tile.
///
/// Use `{:+}` to also print every diagnostic.
#[derive(Debug, Clone)]
pub struct TileReport {
    pub tile: Tile,
    pub state: TileState,
    /// Records read after the header, dropped ones included.
    pub records: usize,
    pub commands: usize,
    pub batches: usize,
    pub dropped: Vec<Diagnostic>,
    /// Set when the tile couldn't be opened or read to the end.
    pub failure: Option<String>,
    pub bounds: Option<Bounds>,
}

impl fmt::Display for TileReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{:?}]: {} records, {} commands in {} batches, {} dropped",
            self.tile.name(),
            self.state,
            self.records,
            self.commands,
            self.batches,
            self.dropped.len()
        )?;
        if let Some(bounds) = &self.bounds {
            write!(f, "\n  bounds: {}", bounds)?;
        }
        if let Some(failure) = &self.failure {
            write!(f, "\n  FAILED: {}", failure)?;
        }
        if f.sign_plus() {
            for d in &self.dropped {
                write!(f, "\n  {}", d)?;
            }
        }
        Ok(())
    }
}

impl TileReport {
    pub fn new(tile: Tile) -> TileReport {
        TileReport {
            tile: tile,
            state: TileState::Discovered,
            records: 0,
            commands: 0,
            batches: 0,
            dropped: vec![],
            failure: None,
            bounds: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    fn enter(&mut self, state: TileState) {
        trace!("{}: {:?} -> {:?}", self.tile.name(), self.state, state);
        self.state = state;
    }

    fn fail(&mut self, reason: String) {
        warn!("{}: abandoning tile: {}", self.tile.name(), reason);
        self.failure = Some(reason);
    }

    fn note_command(&mut self, command: &RenderCommand) {
        self.commands += 1;
        for p in command.points() {
            Bounds::extend(&mut self.bounds, p);
        }
    }

    fn drop_record(&mut self, diagnostic: Diagnostic) {
        warn!("{}: dropped {}", self.tile.name(), &diagnostic);
        self.dropped.push(diagnostic);
    }
}

/// Streams the records of one tile through sanitize/decode/reproject into an emitter.
///
/// The header record is skipped. Fields are split on the configured delimiter without any
/// quote handling: quotes are left to the sanitizer so malformed quoting can't swallow rows.
pub struct TileReader<'a, R: io::Read> {
    records: csv::Reader<R>,
    config: &'a PipelineConfig,
    reprojector: &'a Reprojector,
}

impl<'a> TileReader<'a, File> {
    /// Opens a tile file. The handle lives exactly as long as the reader.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: &'a PipelineConfig,
        reprojector: &'a Reprojector,
    ) -> Result<Self, Box<dyn Error>> {
        let file = File::open(path)?;
        Ok(Self::from_reader(file, config, reprojector))
    }
}

impl<'a, R: io::Read> TileReader<'a, R> {
    pub fn from_reader(source: R, config: &'a PipelineConfig, reprojector: &'a Reprojector) -> Self {
        let records = csv::ReaderBuilder::new()
            .delimiter(config.delimiter)
            .has_headers(true)
            .flexible(true)
            .quoting(false)
            .from_reader(source);
        TileReader {
            records: records,
            config: config,
            reprojector: reprojector,
        }
    }

    /// Pushes the commands of every record, in file order, into the emitter.
    ///
    /// Bad records are dropped and noted in the report. An error is returned only when the
    /// underlying read fails, in which case the rest of the tile is lost.
    pub fn stream<S: CommandSink + ?Sized>(
        &mut self,
        emitter: &mut BatchEmitter<S>,
        report: &mut TileReport,
    ) -> Result<(), Box<dyn Error>> {
        let mut record = csv::StringRecord::new();
        loop {
            match self.records.read_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {
                    report.records += 1;
                    let line = record.position().map_or(0, |p| p.line());
                    match commands_for_record(&record, self.config, self.reprojector) {
                        Ok(commands) => {
                            for command in commands {
                                report.note_command(&command);
                                emitter.push(command);
                            }
                        }
                        Err((reason, detail)) => report.drop_record(Diagnostic {
                            line: line,
                            reason: reason,
                            detail: detail,
                        }),
                    }
                }
                Err(e) => {
                    if let csv::ErrorKind::Io(_) = e.kind() {
                        return Err(e.into());
                    }
                    report.records += 1;
                    let line = e.position().map_or(0, |p| p.line());
                    report.drop_record(Diagnostic {
                        line: line,
                        reason: DropReason::Encoding,
                        detail: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The consumer side of the pipeline.
///
/// `deliver` hands a finished batch over by value and must not wait for the consumer to
/// process it. Whatever execution context the consumer needs is the sink's business.
pub trait CommandSink {
    fn deliver(&mut self, batch: Batch);
}

/// Collects batches in memory.
impl CommandSink for Vec<Batch> {
    fn deliver(&mut self, batch: Batch) {
        self.push(batch);
    }
}

/// Accumulates render commands and hands them to a sink in batches of a fixed size.
///
/// One emitter serves one tile; `finish` flushes whatever is left.
pub struct BatchEmitter<'s, S: CommandSink + ?Sized> {
    sink: &'s mut S,
    tile: usize,
    threshold: usize,
    pending: Vec<RenderCommand>,
    sent: usize,
}

impl<'s, S: CommandSink + ?Sized> BatchEmitter<'s, S> {
    /// A threshold of 0 is treated as 1.
    pub fn new(sink: &'s mut S, tile: usize, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        BatchEmitter {
            sink: sink,
            tile: tile,
            threshold: threshold,
            pending: Vec::with_capacity(threshold),
            sent: 0,
        }
    }

    pub fn push(&mut self, command: RenderCommand) {
        self.pending.push(command);
        if self.pending.len() >= self.threshold {
            self.flush();
        }
    }

    /// Number of batches handed to the sink so far.
    pub fn batches_sent(&self) -> usize {
        self.sent
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let commands = std::mem::replace(&mut self.pending, Vec::with_capacity(self.threshold));
        let batch = Batch {
            tile: self.tile,
            sequence: self.sent,
            commands: commands,
        };
        debug!("Delivering batch {}/{} with {} commands", batch.tile, batch.sequence, batch.len());
        self.sink.deliver(batch);
        self.sent += 1;
    }

    /// Flushes the final, possibly short, batch and returns how many batches were sent.
    pub fn finish(mut self) -> usize {
        self.flush();
        self.sent
    }

    /// Drops the pending commands without delivering them and returns how many there were.
    pub fn abandon(self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod emitter_tests {
    use super::*;

    fn line(i: usize) -> RenderCommand {
        RenderCommand::Line {
            points: vec![ProjectedPoint { lat: 0.0, lon: i as f64 }],
            attribute: i as f64,
        }
    }

    #[test]
    fn threshold() {
        let mut sink: Vec<Batch> = vec![];
        let mut emitter = BatchEmitter::new(&mut sink, 3, 500);
        for i in 0..1200 {
            emitter.push(line(i));
        }
        assert_eq!(emitter.finish(), 3);
        let sizes: Vec<usize> = sink.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, [500, 500, 200]);
        assert!(sink.iter().all(|b| b.tile == 3));
        assert_eq!(sink.iter().map(|b| b.sequence).collect::<Vec<_>>(), [0, 1, 2]);
        // Generation order survives batching.
        let order: Vec<RenderCommand> = sink.into_iter().flat_map(|b| b.commands).collect();
        assert_eq!(order, (0..1200).map(line).collect::<Vec<_>>());
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let mut sink: Vec<Batch> = vec![];
        let mut emitter = BatchEmitter::new(&mut sink, 0, 2);
        for i in 0..4 {
            emitter.push(line(i));
        }
        assert_eq!(emitter.finish(), 2);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn nothing_to_flush() {
        let mut sink: Vec<Batch> = vec![];
        let emitter = BatchEmitter::new(&mut sink, 0, 10);
        assert_eq!(emitter.finish(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn abandon_discards_pending() {
        let mut sink: Vec<Batch> = vec![];
        let mut emitter = BatchEmitter::new(&mut sink, 0, 2);
        for i in 0..3 {
            emitter.push(line(i));
        }
        assert_eq!(emitter.abandon(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn script_text() {
        let batch = Batch {
            tile: 0,
            sequence: 0,
            commands: vec![
                RenderCommand::Line {
                    points: vec![
                        ProjectedPoint { lat: 56.5, lon: 9.25 },
                        ProjectedPoint { lat: 56.0, lon: 10.0 },
                    ],
                    attribute: 12.0,
                },
                RenderCommand::Marker {
                    point: ProjectedPoint { lat: 55.5, lon: -0.5 },
                    label: String::from("B\"1\": 3.5"),
                },
            ],
        };
        assert_eq!(
            batch.to_string(),
            "addLine([[56.5,9.25],[56,10]], 12);\naddMarker(55.5, -0.5, \"B\\\"1\\\": 3.5\");\n"
        );
    }
}

/// Sink adapter over a tokio channel, for a consumer running in its own execution context.
///
/// Unbounded delivery never blocks, so pacing between tiles is the only brake. Bounded
/// delivery blocks the producing thread while the queue is full. Call it from a plain or
/// `spawn_blocking` thread, never from inside an async task.
pub struct ChannelSink {
    sender: BatchSender,
    closed: bool,
}

enum BatchSender {
    Unbounded(mpsc::UnboundedSender<Batch>),
    Bounded(mpsc::Sender<Batch>),
}

/// The consumer end of a ChannelSink.
pub enum BatchReceiver {
    Unbounded(mpsc::UnboundedReceiver<Batch>),
    Bounded(mpsc::Receiver<Batch>),
}

impl BatchReceiver {
    /// Waits for the next batch; None once the producer is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Batch> {
        match self {
            BatchReceiver::Unbounded(rx) => rx.recv().await,
            BatchReceiver::Bounded(rx) => rx.recv().await,
        }
    }

    /// Blocking variant of `recv` for consumers that aren't async.
    pub fn blocking_recv(&mut self) -> Option<Batch> {
        match self {
            BatchReceiver::Unbounded(rx) => rx.blocking_recv(),
            BatchReceiver::Bounded(rx) => rx.blocking_recv(),
        }
    }
}

/// Creates a linked sink and receiver. `None` means unbounded; a depth of 0 is treated as 1.
pub fn batch_channel(depth: Option<usize>) -> (ChannelSink, BatchReceiver) {
    let (sender, receiver) = match depth {
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (BatchSender::Unbounded(tx), BatchReceiver::Unbounded(rx))
        }
        Some(depth) => {
            let (tx, rx) = mpsc::channel(depth.max(1));
            (BatchSender::Bounded(tx), BatchReceiver::Bounded(rx))
        }
    };
    (
        ChannelSink {
            sender: sender,
            closed: false,
        },
        receiver,
    )
}

impl CommandSink for ChannelSink {
    fn deliver(&mut self, batch: Batch) {
        if self.closed {
            return;
        }
        let delivered = match &self.sender {
            BatchSender::Unbounded(tx) => tx.send(batch).is_ok(),
            BatchSender::Bounded(tx) => tx.blocking_send(batch).is_ok(),
        };
        if !delivered {
            warn!("Consumer went away; discarding this and all further batches.");
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod channel_tests {
    use super::*;

    fn batch(sequence: usize) -> Batch {
        Batch {
            tile: 0,
            sequence: sequence,
            commands: vec![],
        }
    }

    #[test]
    fn unbounded_keeps_order() {
        let (mut sink, mut rx) = batch_channel(None);
        for i in 0..5 {
            sink.deliver(batch(i));
        }
        drop(sink);
        let got: Vec<usize> = std::iter::from_fn(|| rx.blocking_recv()).map(|b| b.sequence).collect();
        assert_eq!(got, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn bounded_blocks_until_drained() {
        let (mut sink, mut rx) = batch_channel(Some(1));
        let producer = std::thread::spawn(move || {
            for i in 0..10 {
                sink.deliver(batch(i));
            }
        });
        let got: Vec<usize> = std::iter::from_fn(|| rx.blocking_recv()).map(|b| b.sequence).collect();
        producer.join().unwrap();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn closed_consumer_is_not_fatal() {
        let (mut sink, rx) = batch_channel(Some(1));
        drop(rx);
        sink.deliver(batch(0));
        sink.deliver(batch(1));
        assert!(sink.closed);
    }
}

/// Finds the tile files in `dir` with the given extension, sorted by file name.
///
/// The order is plain lexicographic: `tile_10.csv` sorts before `tile_2.csv`. A directory
/// that doesn't exist simply has no tiles.
pub fn discover_tiles<P: AsRef<Path>>(dir: P, extension: &str) -> Result<Vec<Tile>, Box<dyn Error>> {
    let pattern = format!(
        "{}/*.{}",
        glob::Pattern::escape(&dir.as_ref().to_string_lossy()),
        glob::Pattern::escape(extension)
    );
    let mut paths = vec![];
    for entry in glob::glob(&pattern)? {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => warn!("Skipping unreadable tile candidate: {}", e),
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| Tile::new(i, path))
        .collect())
}

/// Aggregate of all tile reports for one run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub tiles: Vec<TileReport>,
}

impl RunReport {
    pub fn tiles_failed(&self) -> usize {
        self.tiles.iter().filter(|t| !t.is_ok()).count()
    }

    pub fn records(&self) -> usize {
        self.tiles.iter().map(|t| t.records).sum()
    }

    pub fn commands(&self) -> usize {
        self.tiles.iter().map(|t| t.commands).sum()
    }

    pub fn batches(&self) -> usize {
        self.tiles.iter().map(|t| t.batches).sum()
    }

    pub fn dropped(&self) -> usize {
        self.tiles.iter().map(|t| t.dropped.len()).sum()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} tiles ({} failed), {} records, {} commands in {} batches, {} dropped",
            self.tiles.len(),
            self.tiles_failed(),
            self.records(),
            self.commands(),
            self.batches(),
            self.dropped()
        )?;
        for tile in &self.tiles {
            if f.sign_plus() {
                write!(f, "\n{:+}", tile)?;
            } else {
                write!(f, "\n{}", tile)?;
            }
        }
        Ok(())
    }
}

/// Drives tiles through the pipeline one at a time, in sorted order.
///
/// `run` blocks for the whole run (including the pacing sleeps), so it belongs on a worker
/// thread of its own, not on the consumer's.
pub struct Orchestrator {
    config: PipelineConfig,
    reprojector: Arc<Reprojector>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, reprojector: Arc<Reprojector>) -> Orchestrator {
        Orchestrator {
            config: config,
            reprojector: reprojector,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processes every tile in the configured directory. Never fails as a whole.
    pub fn run<S: CommandSink + ?Sized>(&self, sink: &mut S) -> RunReport {
        let dir = self.config.tile_dir.display();
        let tiles = match discover_tiles(&self.config.tile_dir, &self.config.extension) {
            Ok(tiles) => tiles,
            Err(e) => {
                warn!("Tile discovery in {} failed: {}", dir, e);
                vec![]
            }
        };
        if tiles.is_empty() {
            warn!("No *.{} tiles found in {}", self.config.extension, dir);
            return RunReport::default();
        }
        info!("Found {} tiles in {}", tiles.len(), dir);

        let mut report = RunReport::default();
        for tile in &tiles {
            // Give the consumer time to drain what the previous tile queued.
            if tile.ordinal > 0 && !self.config.pacing.is_zero() {
                std::thread::sleep(self.config.pacing);
            }
            report.tiles.push(self.process_tile(tile, sink));
        }
        info!("Run finished: {}", report);
        report
    }

    /// Takes one tile from Discovered to Closed. Failures end up in the report.
    pub fn process_tile<S: CommandSink + ?Sized>(&self, tile: &Tile, sink: &mut S) -> TileReport {
        let mut report = TileReport::new(tile.clone());
        info!("Loading: {}", tile.name());

        let mut reader = match TileReader::open(&tile.path, &self.config, &self.reprojector) {
            Ok(reader) => reader,
            Err(e) => {
                report.fail(format!("open failed: {}", e));
                report.enter(TileState::Closed);
                return report;
            }
        };
        report.enter(TileState::Opened);

        let mut emitter = BatchEmitter::new(sink, tile.ordinal, self.config.batch_size);
        report.enter(TileState::Streaming);
        match reader.stream(&mut emitter, &mut report) {
            Ok(()) => {
                report.batches = emitter.finish();
                report.enter(TileState::Flushed);
                info!("Finished loading tile: {}", &report);
            }
            Err(e) => {
                report.batches = emitter.batches_sent();
                let lost = emitter.abandon();
                report.fail(format!(
                    "read failed after {} records ({} pending commands lost): {}",
                    report.records, lost, e
                ));
            }
        }
        // Close the file before the next tile opens.
        drop(reader);
        report.enter(TileState::Closed);
        report
    }
}

/// Options for `split_into_tiles`.
#[derive(Debug, Clone)]
pub struct SplitOptions {
    /// Records per tile, not counting the repeated header.
    pub records_per_tile: usize,
    pub delimiter: u8,
    /// File name prefix; tiles are named `<prefix>_00000.<extension>` and so on.
    pub prefix: String,
    pub extension: String,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            records_per_tile: DEFAULT_RECORDS_PER_TILE,
            delimiter: b';',
            prefix: String::from("tile"),
            extension: String::from("csv"),
        }
    }
}

/// Returns the name of the i-th tile. Zero padding keeps name order equal to split order.
pub fn tile_file_name(prefix: &str, index: usize, extension: &str) -> String {
    format!("{}_{:05}.{}", prefix, index, extension)
}

/// Partitions a large delimited file into tiles, each starting with the input's header.
///
/// Records are copied byte for byte (no quoting is applied or removed). Returns the paths of
/// the tiles written, in order. An input with no records produces no tiles.
pub fn split_into_tiles<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    out_dir: Q,
    options: &SplitOptions,
) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    if options.records_per_tile == 0 {
        bail!("Records per tile must be at least 1.");
    }
    fs::create_dir_all(out_dir.as_ref())?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .from_path(input.as_ref())?;
    let header = reader.byte_headers()?.clone();

    let mut written: Vec<PathBuf> = vec![];
    let mut writer: Option<csv::Writer<File>> = None;
    let mut count = 0;
    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        if writer.is_none() {
            let path = out_dir
                .as_ref()
                .join(tile_file_name(&options.prefix, written.len(), &options.extension));
            let mut w = csv::WriterBuilder::new()
                .delimiter(options.delimiter)
                .flexible(true)
                .quote_style(csv::QuoteStyle::Never)
                .from_path(&path)?;
            w.write_byte_record(&header)?;
            debug!("Writing {}", path.display());
            written.push(path);
            writer = Some(w);
        }
        if let Some(w) = writer.as_mut() {
            w.write_byte_record(&record)?;
        }
        count += 1;
        if count == options.records_per_tile {
            if let Some(mut w) = writer.take() {
                w.flush()?;
            }
            count = 0;
        }
    }
    if let Some(mut w) = writer.take() {
        w.flush()?;
    }

    info!(
        "Split {} into {} tiles in {}",
        input.as_ref().display(),
        written.len(),
        out_dir.as_ref().display()
    );
    Ok(written)
}
