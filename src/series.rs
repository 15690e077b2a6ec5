//! Series naming: interning pool, name↔id matcher, and the series-name
//! normal form (`metric key1=v1 key2=v2`, tags sorted by key).

use crate::error::{Error, Result};
use crate::types::{ParamId, MAX_SNAME, MAX_TAGS};

use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Bin capacity of the string pool. Bins are append-only; a new bin is
/// started when the current one cannot fit the next name.
const MAX_BIN_SIZE: usize = 128 * 1024;

/// Stable reference to an interned string: bin index + byte range.
/// Refs stay valid forever; bins are never dropped or compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrRef {
    pub bin: u32,
    pub begin: u32,
    pub len: u32,
}

/// Resumable position for pool scans: everything before it has already
/// been visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOffset {
    pub bin: usize,
    pub offset: usize,
}

/// Append-only pool of interned series names.
#[derive(Debug, Default)]
pub struct StringPool {
    bins: Mutex<Vec<Vec<u8>>>,
    counter: AtomicUsize,
}

impl StringPool {
    pub fn new() -> Self {
        StringPool::default()
    }

    /// Copies `name` into the pool and returns a stable reference.
    pub fn add(&self, name: &str) -> StrRef {
        let bytes = name.as_bytes();
        let mut bins = self.bins.lock().expect("string pool lock");
        let needs_new_bin = match bins.last() {
            // +1 for the NUL separator between entries
            Some(bin) => bin.len() + bytes.len() + 1 > MAX_BIN_SIZE,
            None => true,
        };
        if needs_new_bin {
            let mut bin = Vec::new();
            bin.reserve(MAX_BIN_SIZE.max(bytes.len() + 1));
            bins.push(bin);
        }
        let bin_ix = bins.len() - 1;
        let bin = &mut bins[bin_ix];
        let begin = bin.len();
        bin.extend_from_slice(bytes);
        bin.push(0);
        self.counter.fetch_add(1, Ordering::Relaxed);
        StrRef {
            bin: bin_ix as u32,
            begin: begin as u32,
            len: bytes.len() as u32,
        }
    }

    /// Number of interned names.
    pub fn len(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the referenced name out of the pool.
    pub fn get(&self, sref: StrRef) -> Option<String> {
        let bins = self.bins.lock().expect("string pool lock");
        let bin = bins.get(sref.bin as usize)?;
        let begin = sref.begin as usize;
        let end = begin + sref.len as usize;
        if end > bin.len() {
            return None;
        }
        String::from_utf8(bin[begin..end].to_vec()).ok()
    }

    /// Applies `re` to every name interned after `offset`, returning the
    /// matching names. `offset` is advanced to the end of the pool so the
    /// next scan only sees newer rows.
    pub fn regex_scan(&self, re: &Regex, offset: Option<&mut PoolOffset>) -> Vec<String> {
        let bins = self.bins.lock().expect("string pool lock");
        let (skip_bins, mut first_offset) = match &offset {
            Some(off) => (off.bin, off.offset),
            None => (0, 0),
        };
        let mut results = Vec::new();
        for bin in bins.iter().skip(skip_bins) {
            let start = std::mem::take(&mut first_offset).min(bin.len());
            for raw in bin[start..].split(|b| *b == 0) {
                if raw.is_empty() {
                    continue;
                }
                if let Ok(name) = std::str::from_utf8(raw) {
                    if re.is_match(name) {
                        results.push(name.to_string());
                    }
                }
            }
        }
        if let Some(off) = offset {
            match bins.len() {
                0 => *off = PoolOffset::default(),
                n => {
                    off.bin = n - 1;
                    off.offset = bins[n - 1].len();
                }
            }
        }
        results
    }
}

/// Maps interned series names to stable numeric ids and back.
///
/// Ids are assigned on first sight, never change and are never reused.
/// Freshly assigned rows are staged until `pull_new_names` drains them for
/// persistence.
#[derive(Debug)]
pub struct SeriesMatcher {
    pool: StringPool,
    inner: Mutex<MatcherInner>,
}

#[derive(Debug)]
struct MatcherInner {
    table: HashMap<String, ParamId>,
    inv_table: HashMap<ParamId, StrRef>,
    names: Vec<(String, ParamId)>,
    series_id: ParamId,
}

impl SeriesMatcher {
    /// `starting_id` must be greater than every persisted id; id 0 is
    /// reserved for "not found".
    pub fn new(starting_id: ParamId) -> Self {
        assert!(starting_id != 0, "series ids start at 1");
        SeriesMatcher {
            pool: StringPool::new(),
            inner: Mutex::new(MatcherInner {
                table: HashMap::new(),
                inv_table: HashMap::new(),
                names: Vec::new(),
                series_id: starting_id,
            }),
        }
    }

    /// Interns `name` and assigns the next id; returns the existing id if
    /// the name is already known.
    pub fn add(&self, name: &str) -> ParamId {
        let mut inner = self.inner.lock().expect("series matcher lock");
        if let Some(id) = inner.table.get(name) {
            return *id;
        }
        let id = inner.series_id;
        inner.series_id += 1;
        let sref = self.pool.add(name);
        inner.table.insert(name.to_string(), id);
        inner.inv_table.insert(id, sref);
        inner.names.push((name.to_string(), id));
        id
    }

    /// Returns the id of `name`, or 0 if the series is unknown.
    pub fn match_series(&self, name: &str) -> ParamId {
        let inner = self.inner.lock().expect("series matcher lock");
        inner.table.get(name).copied().unwrap_or(0)
    }

    /// Inserts a row loaded from persistence. Does not advance the id
    /// counter and does not stage the row for writing back.
    pub fn insert_loaded(&self, name: &str, id: ParamId) {
        if name.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("series matcher lock");
        let sref = self.pool.add(name);
        inner.table.insert(name.to_string(), id);
        inner.inv_table.insert(id, sref);
    }

    /// Reverse lookup.
    pub fn id_to_series(&self, id: ParamId) -> Option<String> {
        let sref = {
            let inner = self.inner.lock().expect("series matcher lock");
            inner.inv_table.get(&id).copied()
        };
        sref.and_then(|r| self.pool.get(r))
    }

    /// Atomically drains rows staged by `add`; the caller persists them.
    pub fn pull_new_names(&self) -> Vec<(String, ParamId)> {
        let mut inner = self.inner.lock().expect("series matcher lock");
        std::mem::take(&mut inner.names)
    }

    /// Scans every interned name with a regular expression; returns
    /// matching `(name, id)` rows.
    pub fn regex_scan(&self, pattern: &str) -> Result<Vec<(String, ParamId)>> {
        let re = Regex::new(pattern).map_err(|e| Error::QueryParsing(e.to_string()))?;
        let names = self.pool.regex_scan(&re, None);
        let inner = self.inner.lock().expect("series matcher lock");
        Ok(names
            .into_iter()
            .filter_map(|name| inner.table.get(&name).map(|id| (name.clone(), *id)))
            .collect())
    }

    pub fn series_count(&self) -> usize {
        self.pool.len()
    }
}

// --- Series name parsing ---

fn split_tag(token: &str) -> Result<(&str, &str)> {
    let mut parts = token.splitn(2, '=');
    let key = parts.next().unwrap_or("");
    let value = match parts.next() {
        Some(v) => v,
        None => {
            return Err(Error::BadData(format!("tag '{}' has no value", token)));
        }
    };
    if key.is_empty() {
        return Err(Error::BadData(format!("tag '{}' has an empty key", token)));
    }
    if value.contains('=') {
        return Err(Error::BadData(format!("tag '{}' has more than one '='", token)));
    }
    Ok((key, value))
}

/// Converts a series name to its normal form: `metric` followed by tags
/// sorted by key, exactly one space between tokens.
///
/// Two names are the same series iff their normal forms are equal.
pub fn to_normal_form(name: &str) -> Result<String> {
    if name.len() > MAX_SNAME {
        return Err(Error::BadArg(format!(
            "series name is {} bytes, limit is {}",
            name.len(),
            MAX_SNAME
        )));
    }
    let mut tokens = name.split_whitespace();
    let metric = tokens
        .next()
        .ok_or_else(|| Error::BadData("empty series name".to_string()))?;
    if metric.contains('=') {
        return Err(Error::BadData("missing metric name".to_string()));
    }

    let mut tags: Vec<(&str, &str)> = Vec::new();
    for token in tokens {
        if tags.len() == MAX_TAGS {
            return Err(Error::BadData(format!("more than {} tags", MAX_TAGS)));
        }
        tags.push(split_tag(token)?);
    }
    if tags.is_empty() {
        // At least one tag is required
        return Err(Error::BadData("series name has no tags".to_string()));
    }
    tags.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));

    let mut out = String::with_capacity(name.len());
    out.push_str(metric);
    for (key, value) in tags {
        out.push(' ');
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    Ok(out)
}

/// Projects a normal-form series name onto the listed tag keys, keeping
/// the metric and the original tag order.
pub fn filter_tags(name: &str, keys: &[&str]) -> Result<String> {
    let mut tokens = name.split_whitespace();
    let metric = tokens
        .next()
        .ok_or_else(|| Error::BadData("empty series name".to_string()))?;

    let mut out = String::with_capacity(name.len());
    out.push_str(metric);
    let mut kept = 0usize;
    for token in tokens {
        let (key, _) = split_tag(token)?;
        if keys.contains(&key) {
            out.push(' ');
            out.push_str(token);
            kept += 1;
        }
    }
    if kept == 0 {
        return Err(Error::BadData("no tags left after projection".to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn normal_form_sorts_tags() {
        assert_eq!(to_normal_form("cpu b=2 a=1").unwrap(), "cpu a=1 b=2");
        assert_eq!(
            to_normal_form("  mem   host=h1\tregion=eu ").unwrap(),
            "mem host=h1 region=eu"
        );
        // Already normal names stay put
        assert_eq!(to_normal_form("cpu a=1 b=2").unwrap(), "cpu a=1 b=2");
    }

    #[test]
    fn normal_form_rejects_malformed() {
        for bad in ["", "cpu", "cpu novalue", "cpu =1", "cpu a=1=2", "a=1 b=2"] {
            let err = to_normal_form(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::BadData, "input {:?}", bad);
        }
    }

    #[test]
    fn normal_form_rejects_oversized() {
        let name = format!("cpu tag={}", "x".repeat(MAX_SNAME));
        assert_eq!(to_normal_form(&name).unwrap_err().code(), ErrorCode::BadArg);
    }

    #[test]
    fn normal_form_rejects_too_many_tags() {
        let mut name = "cpu".to_string();
        for i in 0..=MAX_TAGS {
            name.push_str(&format!(" k{}={}", i, i));
        }
        assert_eq!(to_normal_form(&name).unwrap_err().code(), ErrorCode::BadData);
    }

    #[test]
    fn filter_tags_projects_and_keeps_order() {
        let name = "cpu a=1 b=2 c=3";
        assert_eq!(filter_tags(name, &["a", "c"]).unwrap(), "cpu a=1 c=3");
        assert_eq!(filter_tags(name, &["b"]).unwrap(), "cpu b=2");
        assert!(filter_tags(name, &["z"]).is_err());
    }

    #[test]
    fn pool_refs_stay_valid_across_bins() {
        let pool = StringPool::new();
        let mut refs = Vec::new();
        // Enough data to roll over several bins
        for i in 0..10_000 {
            let name = format!("metric_{:05} host=server-{:05}", i, i);
            refs.push((name.clone(), pool.add(&name)));
        }
        assert_eq!(pool.len(), 10_000);
        for (name, sref) in refs {
            assert_eq!(pool.get(sref).as_deref(), Some(name.as_str()));
        }
    }

    #[test]
    fn pool_regex_scan_resumes_from_offset() {
        let pool = StringPool::new();
        pool.add("cpu host=a");
        pool.add("mem host=b");
        let re = Regex::new("host").unwrap();
        let mut offset = PoolOffset::default();
        let first = pool.regex_scan(&re, Some(&mut offset));
        assert_eq!(first.len(), 2);

        pool.add("cpu host=c");
        let second = pool.regex_scan(&re, Some(&mut offset));
        assert_eq!(second, vec!["cpu host=c".to_string()]);
    }

    #[test]
    fn matcher_assigns_monotonic_ids() {
        let matcher = SeriesMatcher::new(10);
        let a = matcher.add("cpu a=1 b=2");
        let b = matcher.add("cpu a=1 b=3");
        assert_eq!(a, 10);
        assert_eq!(b, 11);
        assert_eq!(matcher.match_series("cpu a=1 b=2"), a);
        assert_eq!(matcher.match_series("unknown x=1"), 0);
        assert_eq!(matcher.id_to_series(a).as_deref(), Some("cpu a=1 b=2"));
        assert_eq!(matcher.id_to_series(999), None);
        // Adding the same name again returns the original id
        assert_eq!(matcher.add("cpu a=1 b=2"), a);
    }

    #[test]
    fn equivalent_names_map_to_one_id() {
        let matcher = SeriesMatcher::new(1);
        let a = matcher.add(&to_normal_form("cpu b=2 a=1").unwrap());
        let b = matcher.add(&to_normal_form("cpu a=1 b=2").unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn pull_new_names_drains_staging() {
        let matcher = SeriesMatcher::new(1);
        matcher.add("cpu a=1");
        matcher.add("cpu a=2");
        let staged = matcher.pull_new_names();
        assert_eq!(
            staged,
            vec![("cpu a=1".to_string(), 1), ("cpu a=2".to_string(), 2)]
        );
        assert!(matcher.pull_new_names().is_empty());
    }

    #[test]
    fn insert_loaded_skips_staging_and_counter() {
        let matcher = SeriesMatcher::new(100);
        matcher.insert_loaded("cpu a=1", 7);
        assert_eq!(matcher.match_series("cpu a=1"), 7);
        assert_eq!(matcher.id_to_series(7).as_deref(), Some("cpu a=1"));
        assert!(matcher.pull_new_names().is_empty());
        // Fresh ids continue from the configured start
        assert_eq!(matcher.add("cpu a=2"), 100);
    }

    #[test]
    fn regex_scan_returns_ids() {
        let matcher = SeriesMatcher::new(1);
        let cpu = matcher.add("cpu host=a");
        matcher.add("mem host=a");
        let rows = matcher.regex_scan("^cpu").unwrap();
        assert_eq!(rows, vec![("cpu host=a".to_string(), cpu)]);
        assert!(matcher.regex_scan("bad(regex").is_err());
    }
}
