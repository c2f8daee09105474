// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vp-map and core-binding grammar parsing (§6, §10.4).
//!
//! Parsed as line-oriented text rather than TOML/RON -- per §10.4, this
//! grammar describes a run-time core mapping, a different lifecycle from any
//! build-time manifest, so reusing a structured-config crate for it would
//! blur two concerns that are deliberately separate.
//! `Config` errors here are recoverable (§7): the caller logs a warning via
//! `tracing` and falls back to [`VpMap::Flat`] / an unrestricted binding.

use std::fmt;
use std::path::PathBuf;

use crate::err::EngineError;

/// `-V/--vpmap` (§6 "Vp-map grammar").
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VpMap {
    /// One VP per core, one worker per VP. The default.
    Flat,
    /// Derived from hardware topology discovery -- out of scope per §1; the
    /// engine accepts and stores the selector, deferring to whatever
    /// topology collaborator is linked in.
    Hwloc,
    RoundRobin { vps: usize, threads: usize, cores: usize },
    File(PathBuf),
}

impl Default for VpMap {
    fn default() -> Self {
        VpMap::Flat
    }
}

impl fmt::Display for VpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpMap::Flat => write!(f, "flat"),
            VpMap::Hwloc => write!(f, "hwloc"),
            VpMap::RoundRobin { vps, threads, cores } => write!(f, "rr:{vps}:{threads}:{cores}"),
            VpMap::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Parses the `-V/--vpmap` grammar. Never fails hard per §7's Config
/// policy -- the CLI layer is expected to fall back to [`VpMap::Flat`] on
/// `Err` and log a warning; this function just reports what went wrong.
pub fn parse_vpmap(s: &str) -> Result<VpMap, EngineError> {
    let s = s.trim();
    if s == "flat" {
        return Ok(VpMap::Flat);
    }
    if s == "hwloc" {
        return Ok(VpMap::Hwloc);
    }
    if let Some(rest) = s.strip_prefix("file:") {
        return Ok(VpMap::File(PathBuf::from(rest)));
    }
    if let Some(rest) = s.strip_prefix("rr:") {
        let parts: Vec<&str> = rest.split(':').collect();
        let [vps, threads, cores] = parts.as_slice() else {
            return Err(config_err(s, "rr:<vps>:<threads>:<cores> needs exactly 3 fields"));
        };
        let vps = parse_usize(vps, s)?;
        let threads = parse_usize(threads, s)?;
        let cores = parse_usize(cores, s)?;
        return Ok(VpMap::RoundRobin { vps, threads, cores });
    }
    Err(config_err(s, "expected flat, hwloc, rr:<vps>:<threads>:<cores>, or file:<path>"))
}

fn parse_usize(s: &str, whole: &str) -> Result<usize, EngineError> {
    s.parse::<usize>().map_err(|_| config_err(whole, "expected an unsigned integer field"))
}

fn config_err(message: impl Into<String>, fallback: &str) -> EngineError {
    EngineError::Config { message: message.into(), fallback: fallback.into() }
}

/// One line of a `file:<path>` vp-map (§6): `[rank]:<threads>:<binding>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VpMapFileLine {
    pub rank: Option<u32>,
    pub threads: usize,
    pub binding: CoreSelector,
}

/// Parses one `[rank]:<threads>:<binding>` line. `<binding>` follows the
/// same comma/dash/hex/range shapes as the top-level binding grammar; the
/// per-line form uses `;`-separated ranges (`start;end;step`) where the
/// top-level grammar uses `:`-separated ones, matching §6 exactly.
pub fn parse_vpmap_file_line(line: &str) -> Result<VpMapFileLine, EngineError> {
    let mut parts = line.splitn(3, ':');
    let rank_field = parts.next().unwrap_or("");
    let threads_field = parts
        .next()
        .ok_or_else(|| config_err(line, "vp-map file line needs rank:threads:binding"))?;
    let binding_field = parts
        .next()
        .ok_or_else(|| config_err(line, "vp-map file line needs rank:threads:binding"))?;

    let rank = if rank_field.is_empty() {
        None
    } else {
        Some(rank_field.parse::<u32>().map_err(|_| config_err(line, "bad rank field"))?)
    };
    let threads = parse_usize(threads_field, line)?;
    let binding = parse_core_selector(binding_field, ';')?;
    Ok(VpMapFileLine { rank, threads, binding })
}

/// A set of cores, in one of three shapes (§6 "Binding grammar").
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CoreSelector {
    /// `0,3,5-8`
    List(Vec<usize>),
    /// `xDEADBEEF`: one bit per core.
    HexMask(u64),
    /// `[start]:[end]:[step]` (or, within a vp-map file line, `;`-separated).
    /// Any field may be omitted; omitted `start` means 0, omitted `step`
    /// means 1, omitted `end` means "every core the topology reports".
    Range { start: Option<usize>, end: Option<usize>, step: Option<usize> },
}

impl fmt::Display for CoreSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreSelector::List(items) => {
                let rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", rendered.join(","))
            }
            CoreSelector::HexMask(mask) => write!(f, "x{mask:X}"),
            CoreSelector::Range { start, end, step } => {
                let s = start.map(|v| v.to_string()).unwrap_or_default();
                let e = end.map(|v| v.to_string()).unwrap_or_default();
                let st = step.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "{s}:{e}:{st}")
            }
        }
    }
}

/// Resolves a [`CoreSelector`] against a known topology width, for callers
/// (C10) that need an explicit core list rather than the selector shape.
impl CoreSelector {
    pub fn resolve(&self, topology_width: usize) -> Vec<usize> {
        match self {
            CoreSelector::List(items) => items.clone(),
            CoreSelector::HexMask(mask) => (0..topology_width).filter(|i| mask & (1 << i) != 0).collect(),
            CoreSelector::Range { start, end, step } => {
                let start = start.unwrap_or(0);
                let end = end.unwrap_or(topology_width.saturating_sub(1));
                let step = step.unwrap_or(1).max(1);
                if start > end {
                    return Vec::new();
                }
                (start..=end).step_by(step).collect()
            }
        }
    }
}

/// The top-level `-b/--dague_bind` binding spec (§6): either an inline core
/// selector, with whether the comm thread (leading `+`) is included in the
/// mapping, or `file:<path>` -- one process per line, each itself one of the
/// three inline shapes (§6's "file:<path> (one process per line)").
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Binding {
    Inline { include_comm_thread: bool, selector: CoreSelector },
    File { include_comm_thread: bool, path: PathBuf },
}

/// Parses the top-level `-b/--dague_bind` grammar.
pub fn parse_binding(s: &str) -> Result<Binding, EngineError> {
    let (include_comm_thread, rest) = match s.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if let Some(path) = rest.strip_prefix("file:") {
        return Ok(Binding::File { include_comm_thread, path: PathBuf::from(path) });
    }
    Ok(Binding::Inline { include_comm_thread, selector: parse_core_selector(rest, ':')? })
}

fn parse_core_selector(s: &str, range_sep: char) -> Result<CoreSelector, EngineError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('x').or_else(|| s.strip_prefix("0x")) {
        let mask = u64::from_str_radix(hex, 16).map_err(|_| config_err(s, "bad hex core mask"))?;
        return Ok(CoreSelector::HexMask(mask));
    }
    if s.contains(range_sep) && !s.contains(',') {
        let fields: Vec<&str> = s.splitn(3, range_sep).collect();
        let start = parse_opt_usize(fields.first().copied().unwrap_or(""), s)?;
        let end = parse_opt_usize(fields.get(1).copied().unwrap_or(""), s)?;
        let step = parse_opt_usize(fields.get(2).copied().unwrap_or(""), s)?;
        return Ok(CoreSelector::Range { start, end, step });
    }
    let mut items = Vec::new();
    for piece in s.split(',') {
        if let Some((lo, hi)) = piece.split_once('-') {
            let lo = parse_usize(lo, s)?;
            let hi = parse_usize(hi, s)?;
            items.extend(lo..=hi);
        } else if !piece.is_empty() {
            items.push(parse_usize(piece, s)?);
        }
    }
    Ok(CoreSelector::List(items))
}

fn parse_opt_usize(s: &str, whole: &str) -> Result<Option<usize>, EngineError> {
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parse_usize(s, whole)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_and_hwloc() {
        assert_eq!(parse_vpmap("flat").unwrap(), VpMap::Flat);
        assert_eq!(parse_vpmap("hwloc").unwrap(), VpMap::Hwloc);
    }

    #[test]
    fn rr_round_trips_through_display() {
        let original = "rr:2:4:8";
        let parsed = parse_vpmap(original).unwrap();
        assert_eq!(parsed.to_string(), original);
        assert_eq!(parse_vpmap(&parsed.to_string()).unwrap(), parsed);
    }

    #[test]
    fn bad_vpmap_is_a_config_error() {
        assert!(parse_vpmap("bogus").is_err());
        assert!(parse_vpmap("rr:1:2").is_err());
    }

    #[test]
    fn hex_mask_round_trips_through_display() {
        let Binding::Inline { selector, .. } = parse_binding("x0F").unwrap() else {
            panic!("expected inline binding");
        };
        assert_eq!(selector.to_string(), "xF");
        let Binding::Inline { selector: reparsed, .. } = parse_binding(&selector.to_string()).unwrap() else {
            panic!("expected inline binding");
        };
        assert_eq!(reparsed, selector);
    }

    #[test]
    fn list_with_dash_range_expands() {
        let Binding::Inline { selector, .. } = parse_binding("0,3,5-8").unwrap() else {
            panic!("expected inline binding");
        };
        assert_eq!(selector, CoreSelector::List(vec![0, 3, 5, 6, 7, 8]));
    }

    #[test]
    fn leading_plus_includes_comm_thread() {
        let Binding::Inline { include_comm_thread, selector } = parse_binding("+0,1").unwrap() else {
            panic!("expected inline binding");
        };
        assert!(include_comm_thread);
        assert_eq!(selector, CoreSelector::List(vec![0, 1]));
    }

    #[test]
    fn file_binding_is_recognized() {
        let binding = parse_binding("file:/tmp/bindings.txt").unwrap();
        assert!(matches!(binding, Binding::File { include_comm_thread: false, .. }));
    }

    #[test]
    fn range_resolves_against_topology_width() {
        let selector = CoreSelector::Range { start: Some(1), end: None, step: Some(2) };
        assert_eq!(selector.resolve(6), vec![1, 3, 5]);
    }

    #[test]
    fn vpmap_file_line_splits_rank_threads_binding() {
        let line = parse_vpmap_file_line("2:4:0,1;2;3").unwrap();
        assert_eq!(line.rank, Some(2));
        assert_eq!(line.threads, 4);
        assert!(matches!(line.binding, CoreSelector::List(_)));

        let line2 = parse_vpmap_file_line(":4:1;4;1").unwrap();
        assert_eq!(line2.rank, None);
        assert_eq!(line2.binding, CoreSelector::Range { start: Some(1), end: Some(4), step: Some(1) });
    }
}
