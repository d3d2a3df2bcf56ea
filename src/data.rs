//! Preference data source
//!
//! Yields ranked `(chosen, rejected)` pairs from an external corpus (a local
//! file or directory, or a HuggingFace hub dataset) or from a tiny built-in
//! corpus used when no external corpus is available.

use crate::error::{Error, Result};
use hf_hub::api::sync::Api;
use polars::prelude::{DataFrame, ParquetReader, SerReader};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const HUB_PREFIX: &str = "hf://";
const FALLBACK_NAME: &str = "builtin-fallback";
const CORPUS_EXTENSIONS: [&str; 3] = ["jsonl", "json", "parquet"];

/// A ranked preference pair. `chosen` is always the preferred completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceExample {
    chosen: String,
    rejected: String,
}

impl PreferenceExample {
    /// Creates a new `PreferenceExample`, rejecting empty completions.
    ///
    /// ```rust
    /// use reward_model_rs::data::PreferenceExample;
    ///
    /// let example = PreferenceExample::new("Paris.", "Berlin.").unwrap();
    /// assert_eq!(example.chosen(), "Paris.");
    /// ```
    pub fn new(chosen: &str, rejected: &str) -> Result<Self> {
        if chosen.is_empty() || rejected.is_empty() {
            return Err(Error::DataSource {
                source_name: "example".to_string(),
                reason: "chosen and rejected completions must be non-empty".to_string(),
            });
        }
        Ok(Self {
            chosen: chosen.to_string(),
            rejected: rejected.to_string(),
        })
    }

    pub fn chosen(&self) -> &str {
        &self.chosen
    }

    pub fn rejected(&self) -> &str {
        &self.rejected
    }
}

/// A record as stored in an external corpus
#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    #[serde(default)]
    prompt: Option<String>,
    chosen: String,
    rejected: String,
}

impl RawRecord {
    fn into_example(self, index: usize, source_name: &str) -> Result<PreferenceExample> {
        let (chosen, rejected) = match self.prompt.as_deref() {
            Some(prompt) if !prompt.is_empty() => (
                format!("{prompt}\n\n{}", self.chosen),
                format!("{prompt}\n\n{}", self.rejected),
            ),
            _ => (self.chosen, self.rejected),
        };
        if chosen.is_empty() || rejected.is_empty() {
            return Err(Error::DataSource {
                source_name: source_name.to_string(),
                reason: format!("record {index} has an empty completion"),
            });
        }
        Ok(PreferenceExample { chosen, rejected })
    }
}

/// The built-in corpus: a fixed list of hand-authored pairs.
pub fn fallback_examples() -> Vec<PreferenceExample> {
    fallback_records()
        .into_iter()
        .map(|r| PreferenceExample {
            chosen: r.chosen,
            rejected: r.rejected,
        })
        .collect()
}

fn fallback_records() -> Vec<RawRecord> {
    let pairs = [
        (
            "The capital of France is Paris.",
            "The capital of France is Berlin.",
        ),
        (
            "Water boils at 100 degrees Celsius at sea level.",
            "Water boils at 10 degrees Celsius at sea level.",
        ),
    ];
    pairs
        .into_iter()
        .map(|(chosen, rejected)| RawRecord {
            prompt: None,
            chosen: chosen.to_string(),
            rejected: rejected.to_string(),
        })
        .collect()
}

/// A named split with an optional `[start:end]` range, e.g. `train[:8]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    name: String,
    start: usize,
    end: Option<usize>,
}

impl Split {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start: 0,
            end: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> Option<usize> {
        self.end
    }
}

impl FromStr for Split {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: &str| Error::invalid_config(format!("bad split `{s}`: {why}"));
        let s = s.trim();
        let Some(open) = s.find('[') else {
            if s.is_empty() {
                return Err(bad("empty name"));
            }
            return Ok(Split::new(s));
        };
        let name = &s[..open];
        let range = s[open + 1..]
            .strip_suffix(']')
            .ok_or_else(|| bad("missing `]`"))?;
        let (start, end) = range.split_once(':').ok_or_else(|| bad("missing `:`"))?;
        let parse = |v: &str| -> Result<Option<usize>> {
            let v = v.trim();
            if v.is_empty() {
                Ok(None)
            } else {
                v.parse::<usize>()
                    .map(Some)
                    .map_err(|_| bad("range bound is not an integer"))
            }
        };
        let start = parse(start)?.unwrap_or(0);
        let end = parse(end)?;
        if name.is_empty() {
            return Err(bad("empty name"));
        }
        if end.is_some_and(|e| e < start) {
            return Err(bad("end precedes start"));
        }
        Ok(Self {
            name: name.to_string(),
            start,
            end,
        })
    }
}

impl Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.start, self.end) {
            (0, None) => write!(f, "{}", self.name),
            (start, None) => write!(f, "{}[{start}:]", self.name),
            (0, Some(end)) => write!(f, "{}[:{end}]", self.name),
            (start, Some(end)) => write!(f, "{}[{start}:{end}]", self.name),
        }
    }
}

/// Where an external corpus lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusLocation {
    Path(PathBuf),
    /// HuggingFace hub dataset repo id, e.g. `hf://owner/name`
    Hub(String),
}

impl FromStr for CorpusLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.strip_prefix(HUB_PREFIX) {
            Some("") => Err(Error::invalid_config("empty hub dataset id")),
            Some(repo) => Ok(CorpusLocation::Hub(repo.to_string())),
            None => Ok(CorpusLocation::Path(PathBuf::from(s))),
        }
    }
}

impl Display for CorpusLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorpusLocation::Path(p) => write!(f, "{}", p.display()),
            CorpusLocation::Hub(repo) => write!(f, "{HUB_PREFIX}{repo}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DataSourceConfig {
    External(CorpusLocation),
    #[default]
    Fallback,
}

impl FromStr for DataSourceConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("fallback") {
            Ok(DataSourceConfig::Fallback)
        } else {
            Ok(DataSourceConfig::External(s.parse()?))
        }
    }
}

/// A source after availability has been checked
#[derive(Debug, Clone)]
enum ResolvedSource {
    Fallback,
    File(PathBuf),
    Dir(PathBuf),
    Hub { repo: String, files: Vec<String> },
}

/// Preference data source, resolved once at construction.
#[derive(Debug, Clone)]
pub struct PreferenceSource {
    resolved: ResolvedSource,
}

impl PreferenceSource {
    /// Resolves `config`. An unavailable external corpus falls back to the
    /// built-in corpus when `allow_fallback` is set and is an error otherwise.
    pub fn new(config: &DataSourceConfig, allow_fallback: bool) -> Result<Self> {
        let resolved = match config {
            DataSourceConfig::Fallback => ResolvedSource::Fallback,
            DataSourceConfig::External(location) => match resolve_external(location) {
                Ok(resolved) => resolved,
                Err(reason) if allow_fallback => {
                    warn!(
                        corpus = %location,
                        %reason,
                        "External corpus unavailable, using built-in fallback"
                    );
                    ResolvedSource::Fallback
                }
                Err(reason) => {
                    return Err(Error::DataSource {
                        source_name: location.to_string(),
                        reason,
                    })
                }
            },
        };
        debug!(source = ?resolved, "Resolved preference data source");
        Ok(Self { resolved })
    }

    /// The built-in corpus.
    pub fn fallback() -> Self {
        Self {
            resolved: ResolvedSource::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.resolved, ResolvedSource::Fallback)
    }

    pub fn name(&self) -> String {
        match &self.resolved {
            ResolvedSource::Fallback => FALLBACK_NAME.to_string(),
            ResolvedSource::File(p) | ResolvedSource::Dir(p) => p.display().to_string(),
            ResolvedSource::Hub { repo, .. } => format!("{HUB_PREFIX}{repo}"),
        }
    }

    /// Returns a lazy iterator over the examples of `split`, truncated to `limit`.
    ///
    /// Every call starts again from the beginning of the split.
    pub fn load(&self, split: &Split, limit: Option<usize>) -> Result<PreferenceIter> {
        let source_name = self.name();
        let records = match &self.resolved {
            ResolvedSource::Fallback => Records::Memory(fallback_records().into_iter()),
            ResolvedSource::File(path) => open_records(path, &source_name)?,
            ResolvedSource::Dir(dir) => {
                let path = CORPUS_EXTENSIONS
                    .iter()
                    .map(|ext| dir.join(format!("{}.{ext}", split.name())))
                    .find(|p| p.exists())
                    .ok_or_else(|| Error::DataSource {
                        source_name: source_name.clone(),
                        reason: format!("no corpus file for split `{}`", split.name()),
                    })?;
                open_records(&path, &source_name)?
            }
            ResolvedSource::Hub { repo, files } => {
                let path = download_hub_split(repo, files, split.name()).map_err(|reason| {
                    Error::DataSource {
                        source_name: source_name.clone(),
                        reason,
                    }
                })?;
                open_records(&path, &source_name)?
            }
        };

        let start = split.start();
        let limit_end = limit.map(|l| start.saturating_add(l));
        let end = match (split.end(), limit_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        debug!(source = %source_name, %split, ?limit, "Loading preference examples");
        Ok(PreferenceIter {
            records,
            source_name,
            index: 0,
            start,
            end,
            failed: false,
        })
    }
}

fn resolve_external(location: &CorpusLocation) -> std::result::Result<ResolvedSource, String> {
    match location {
        CorpusLocation::Path(path) if path.is_dir() => Ok(ResolvedSource::Dir(path.clone())),
        CorpusLocation::Path(path) if path.is_file() => Ok(ResolvedSource::File(path.clone())),
        CorpusLocation::Path(path) => Err(format!("{} does not exist", path.display())),
        CorpusLocation::Hub(repo) => {
            let api = Api::new().map_err(|e| e.to_string())?;
            let info = api.dataset(repo.clone()).info().map_err(|e| e.to_string())?;
            let files = info.siblings.into_iter().map(|s| s.rfilename).collect();
            Ok(ResolvedSource::Hub {
                repo: repo.clone(),
                files,
            })
        }
    }
}

fn download_hub_split(
    repo: &str,
    files: &[String],
    split: &str,
) -> std::result::Result<PathBuf, String> {
    let candidates = CORPUS_EXTENSIONS.iter().flat_map(|ext| {
        [format!("{split}.{ext}"), format!("data/{split}.{ext}")]
    });
    let filename = candidates
        .into_iter()
        .find(|c| files.contains(c))
        .ok_or_else(|| format!("no file for split `{split}` in hub dataset"))?;
    info!(repo, file = %filename, "Downloading preference split from hub");
    let api = Api::new().map_err(|e| e.to_string())?;
    api.dataset(repo.to_string())
        .get(&filename)
        .map_err(|e| e.to_string())
}

fn open_records(path: &Path, source_name: &str) -> Result<Records> {
    let io_err = |e: &dyn Display| Error::DataSource {
        source_name: source_name.to_string(),
        reason: format!("{}: {e}", path.display()),
    };
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jsonl" => {
            let file = File::open(path).map_err(|e| io_err(&e))?;
            Ok(Records::Lines(BufReader::new(file).lines()))
        }
        "json" => {
            let file = File::open(path).map_err(|e| io_err(&e))?;
            let records: Vec<RawRecord> =
                serde_json::from_reader(BufReader::new(file)).map_err(|e| io_err(&e))?;
            Ok(Records::Memory(records.into_iter()))
        }
        "parquet" => {
            let mut file = File::open(path).map_err(|e| io_err(&e))?;
            let df = ParquetReader::new(&mut file)
                .finish()
                .map_err(|e| io_err(&e))?;
            let records = records_from_dataframe(&df).map_err(|e| io_err(&e))?;
            Ok(Records::Memory(records.into_iter()))
        }
        other => Err(io_err(&format!("unsupported corpus format `{other}`"))),
    }
}

fn records_from_dataframe(df: &DataFrame) -> polars::prelude::PolarsResult<Vec<RawRecord>> {
    let strings = |name: &str| -> polars::prelude::PolarsResult<Vec<Option<String>>> {
        Ok(df
            .column(name)?
            .as_materialized_series()
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_owned))
            .collect())
    };
    let chosen = strings("chosen")?;
    let rejected = strings("rejected")?;
    let prompts = strings("prompt").unwrap_or_else(|_| vec![None; chosen.len()]);
    Ok(chosen
        .into_iter()
        .zip(rejected)
        .zip(prompts)
        .map(|((chosen, rejected), prompt)| RawRecord {
            prompt,
            chosen: chosen.unwrap_or_default(),
            rejected: rejected.unwrap_or_default(),
        })
        .collect())
}

enum Records {
    Memory(std::vec::IntoIter<RawRecord>),
    Lines(Lines<BufReader<File>>),
}

/// Lazy, finite iterator over the examples of one split.
pub struct PreferenceIter {
    records: Records,
    source_name: String,
    index: usize,
    start: usize,
    end: Option<usize>,
    failed: bool,
}

impl PreferenceIter {
    fn fail(&mut self, reason: String) -> Option<Result<PreferenceExample>> {
        self.failed = true;
        Some(Err(Error::DataSource {
            source_name: self.source_name.clone(),
            reason,
        }))
    }
}

impl Iterator for PreferenceIter {
    type Item = Result<PreferenceExample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed || self.end.is_some_and(|end| self.index >= end) {
                return None;
            }
            let index = self.index;
            let skip = index < self.start;
            let record = match &mut self.records {
                Records::Memory(records) => records.next()?,
                Records::Lines(lines) => {
                    let line = match lines.next()? {
                        Ok(line) => line,
                        Err(e) => return self.fail(format!("record {index}: {e}")),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if skip {
                        self.index += 1;
                        continue;
                    }
                    match serde_json::from_str::<RawRecord>(&line) {
                        Ok(record) => record,
                        Err(e) => return self.fail(format!("record {index}: {e}")),
                    }
                }
            };
            self.index += 1;
            if skip {
                continue;
            }
            return match record.into_example(index, &self.source_name) {
                Ok(example) => Some(Ok(example)),
                Err(e) => {
                    self.failed = true;
                    Some(Err(e))
                }
            };
        }
    }
}

pub struct PreferenceDataset_ {
    data: Vec<PreferenceExample>,
}

/// Materialized preference examples
///
/// NOTE: This is a Rc-wrapped `PreferenceDataset_`, cloning is cheap.
#[derive(Clone)]
pub struct PreferenceDataset(Rc<PreferenceDataset_>);

impl std::ops::Deref for PreferenceDataset {
    type Target = PreferenceDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PreferenceDataset {
    pub fn new(data: Vec<PreferenceExample>) -> Self {
        Self(Rc::new(PreferenceDataset_ { data }))
    }

    /// Reads a whole split into memory, failing on the first malformed record.
    pub fn load(source: &PreferenceSource, split: &Split, limit: Option<usize>) -> Result<Self> {
        let data = source.load(split, limit)?.collect::<Result<Vec<_>>>()?;
        Ok(Self::new(data))
    }

    /// Gets the number of preference pairs.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Checks whether the dataset has no preference pairs.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_item_at_index(&self, idx: usize) -> Option<&PreferenceExample> {
        self.data.get(idx)
    }

    pub fn data(&self) -> &Vec<PreferenceExample> {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[fixture]
    fn corpus_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let mut train = File::create(dir.path().join("train.jsonl")).unwrap();
        for ix in 0..5 {
            writeln!(
                train,
                r#"{{"chosen": "good answer {ix}", "rejected": "bad answer {ix}"}}"#
            )
            .unwrap();
            writeln!(train).unwrap();
        }
        let test = r#"[{"prompt": "Question?", "chosen": "yes", "rejected": "no"}]"#;
        std::fs::write(dir.path().join("test.json"), test).unwrap();
        dir
    }

    fn collect(iter: PreferenceIter) -> Result<Vec<PreferenceExample>> {
        Ok(iter.collect::<crate::Result<Vec<_>>>()?)
    }

    #[rstest]
    fn test_preference_example_rejects_empty_sides() {
        assert!(PreferenceExample::new("", "no").is_err());
        assert!(PreferenceExample::new("yes", "").is_err());
        assert!(PreferenceExample::new("yes", "no").is_ok());
    }

    #[rstest]
    #[case("train", "train", 0, None)]
    #[case("train[:8]", "train", 0, Some(8))]
    #[case("test[2:10]", "test", 2, Some(10))]
    #[case("validation[3:]", "validation", 3, None)]
    fn test_split_from_str(
        #[case] expr: &str,
        #[case] name: &str,
        #[case] start: usize,
        #[case] end: Option<usize>,
    ) -> Result<()> {
        let split: Split = expr.parse()?;
        assert_eq!(split.name(), name);
        assert_eq!(split.start(), start);
        assert_eq!(split.end(), end);
        assert_eq!(split.to_string(), expr);
        Ok(())
    }

    #[rstest]
    #[case("")]
    #[case("train[:8")]
    #[case("train[8]")]
    #[case("train[x:]")]
    #[case("train[5:2]")]
    fn test_split_from_str_invalid(#[case] expr: &str) {
        assert!(expr.parse::<Split>().is_err());
    }

    #[rstest]
    fn test_fallback_is_restartable() -> Result<()> {
        let source = PreferenceSource::fallback();
        let split = Split::new("train");
        let first = collect(source.load(&split, None)?)?;
        let second = collect(source.load(&split, None)?)?;

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(first, fallback_examples());
        Ok(())
    }

    #[rstest]
    fn test_limit_preserves_order() -> Result<()> {
        let source = PreferenceSource::fallback();
        let examples = collect(source.load(&Split::new("test"), Some(1))?)?;

        assert_eq!(examples, fallback_examples()[..1].to_vec());
        Ok(())
    }

    #[rstest]
    fn test_directory_corpus_split_range_and_limit(corpus_dir: TempDir) -> Result<()> {
        let config = DataSourceConfig::External(CorpusLocation::Path(corpus_dir.path().into()));
        let source = PreferenceSource::new(&config, false)?;
        assert!(!source.is_fallback());

        let all = collect(source.load(&"train".parse()?, None)?)?;
        assert_eq!(all.len(), 5);

        let ranged = collect(source.load(&"train[1:4]".parse()?, Some(2))?)?;
        assert_eq!(ranged, all[1..3].to_vec());
        assert_eq!(ranged[0].chosen(), "good answer 1");
        Ok(())
    }

    #[rstest]
    fn test_prompt_is_prefixed(corpus_dir: TempDir) -> Result<()> {
        let config = DataSourceConfig::External(CorpusLocation::Path(corpus_dir.path().into()));
        let source = PreferenceSource::new(&config, false)?;
        let examples = collect(source.load(&Split::new("test"), None)?)?;

        assert_eq!(examples[0].chosen(), "Question?\n\nyes");
        assert_eq!(examples[0].rejected(), "Question?\n\nno");
        Ok(())
    }

    #[rstest]
    fn test_missing_corpus_without_fallback_fails() {
        let config: DataSourceConfig = "/definitely/not/here.jsonl".parse().unwrap();
        let err = PreferenceSource::new(&config, false).err().unwrap();
        assert_eq!(err.kind(), "DataSourceError");
    }

    #[rstest]
    fn test_missing_corpus_with_fallback_resolves_once() -> Result<()> {
        let config: DataSourceConfig = "/definitely/not/here.jsonl".parse()?;
        let source = PreferenceSource::new(&config, true)?;
        assert!(source.is_fallback());
        let dataset = PreferenceDataset::load(&source, &Split::new("train"), None)?;
        assert_eq!(dataset.len(), 2);
        Ok(())
    }

    #[rstest]
    fn test_malformed_record_reports_index() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("train.jsonl");
        std::fs::write(
            &path,
            "{\"chosen\": \"a\", \"rejected\": \"b\"}\n{\"chosen\": \"a\"}\n",
        )?;
        let config = DataSourceConfig::External(CorpusLocation::Path(path));
        let source = PreferenceSource::new(&config, false)?;
        let mut iter = source.load(&Split::new("train"), None)?;

        assert!(iter.next().unwrap().is_ok());
        let err = iter.next().unwrap().err().unwrap();
        assert!(err.to_string().contains("record 1"));
        assert!(iter.next().is_none());
        Ok(())
    }

    #[rstest]
    fn test_data_source_config_from_str() -> Result<()> {
        assert_eq!(
            "fallback".parse::<DataSourceConfig>()?,
            DataSourceConfig::Fallback
        );
        assert_eq!(
            "hf://owner/prefs".parse::<DataSourceConfig>()?,
            DataSourceConfig::External(CorpusLocation::Hub("owner/prefs".to_string()))
        );
        Ok(())
    }
}
