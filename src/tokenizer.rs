//! Tokenizer adapters
//!
//! The pipeline only relies on the `TokenizerAdapter` contract. Two adapters are
//! provided: a HuggingFace `tokenizers` BPE loaded from a directory, and the
//! bundled GPT-2 encoding from `tiktoken-rs`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tiktoken_rs::{get_bpe_from_model, CoreBPE};
use tokenizers::decoders::byte_level::ByteLevel as ByteLevelDecoder;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
pub const VOCAB_FILENAME: &str = "vocab.json";
pub const MERGES_FILENAME: &str = "merges.txt";
pub const META_FILENAME: &str = "bpe_meta.json";
pub const TIKTOKEN_GPT2: &str = "tiktoken:gpt2";
pub const DEFAULT_PAD_TOKEN_ID: u32 = 50_256;
const GPT2_VOCAB_SIZE: usize = 50_257;
const PAD_TOKEN: &str = "<pad>";

/// Maps text to token ids and back.
pub trait TokenizerAdapter {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Id written into padded positions.
    fn pad_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

impl<T: TokenizerAdapter + ?Sized> TokenizerAdapter for Box<T> {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids)
    }

    fn pad_token_id(&self) -> u32 {
        (**self).pad_token_id()
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }
}

/// Optional metadata stored next to the vocabulary
#[derive(Debug, Default, Deserialize)]
struct BpeMeta {
    vocab_size: Option<usize>,
    #[serde(default)]
    special_tokens: Vec<String>,
}

/// Byte-level BPE tokenizer backed by HuggingFace `tokenizers`
pub struct BpeTokenizer {
    inner: Tokenizer,
    pad_token_id: u32,
    vocab_size: usize,
}

impl BpeTokenizer {
    /// Loads a tokenizer from a directory.
    ///
    /// Looks for `tokenizer.json` first, then a `vocab.json` + `merges.txt` pair,
    /// then any `*.json` + `*.txt` pair. `bpe_meta.json` is read when present.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let load_err = |reason: String| Error::TokenizerLoad {
            path: dir.to_path_buf(),
            reason,
        };
        if !dir.is_dir() {
            return Err(load_err("not a directory".to_string()));
        }

        let tokenizer_file = dir.join(TOKENIZER_FILENAME);
        let inner = if tokenizer_file.exists() {
            debug!(path = %tokenizer_file.display(), "Loading tokenizer.json");
            Tokenizer::from_file(&tokenizer_file).map_err(|e| load_err(e.to_string()))?
        } else {
            let (vocab, merges) = find_vocab_and_merges(dir).ok_or_else(|| {
                load_err(format!(
                    "could not find {TOKENIZER_FILENAME} or {VOCAB_FILENAME}/{MERGES_FILENAME}"
                ))
            })?;
            debug!(
                vocab = %vocab.display(),
                merges = %merges.display(),
                "Loading BPE vocab and merges"
            );
            let vocab = vocab.to_string_lossy().to_string();
            let merges = merges.to_string_lossy().to_string();
            let bpe = BPE::from_file(&vocab, &merges)
                .build()
                .map_err(|e| load_err(e.to_string()))?;
            let mut tokenizer = Tokenizer::new(bpe);
            tokenizer.with_pre_tokenizer(Some(ByteLevel::default()));
            tokenizer.with_decoder(Some(ByteLevelDecoder::default()));
            tokenizer
        };

        let meta_file = dir.join(META_FILENAME);
        let meta: BpeMeta = if meta_file.exists() {
            let raw = fs::read_to_string(&meta_file).map_err(|e| load_err(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| load_err(format!("bad {META_FILENAME}: {e}")))?
        } else {
            BpeMeta::default()
        };

        Ok(Self::from_tokenizer(inner, &meta))
    }

    fn from_tokenizer(inner: Tokenizer, meta: &BpeMeta) -> Self {
        let pad_token_id = std::iter::once(PAD_TOKEN)
            .chain(meta.special_tokens.iter().map(String::as_str))
            .find_map(|tok| inner.token_to_id(tok))
            .unwrap_or_else(|| {
                warn!("Tokenizer has no pad token, padding with id 0");
                0
            });
        let actual = inner.get_vocab_size(true);
        if let Some(declared) = meta.vocab_size {
            if declared != actual {
                debug!(declared, actual, "Declared vocab_size differs");
            }
        }
        Self {
            inner,
            pad_token_id,
            vocab_size: actual,
        }
    }
}

fn find_vocab_and_merges(dir: &Path) -> Option<(PathBuf, PathBuf)> {
    let vocab = dir.join(VOCAB_FILENAME);
    let merges = dir.join(MERGES_FILENAME);
    if vocab.exists() && merges.exists() {
        return Some((vocab, merges));
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    let with_ext = |ext: &str| {
        entries
            .iter()
            .find(|p| {
                p.extension().is_some_and(|e| e == ext) && !p.ends_with(META_FILENAME)
            })
            .cloned()
    };
    Some((with_ext("json")?, with_ext("txt")?))
}

impl TokenizerAdapter for BpeTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization {
                reason: e.to_string(),
            })?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner.decode(ids, true).map_err(|e| Error::Tokenization {
            reason: e.to_string(),
        })
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// GPT-2 encoding bundled with `tiktoken-rs`, padded with `<|endoftext|>`
pub struct Gpt2Tokenizer {
    bpe: CoreBPE,
}

impl Gpt2Tokenizer {
    pub fn new() -> Result<Self> {
        let bpe = get_bpe_from_model("gpt2").map_err(|e| Error::TokenizerLoad {
            path: PathBuf::from(TIKTOKEN_GPT2),
            reason: e.to_string(),
        })?;
        Ok(Self { bpe })
    }
}

impl TokenizerAdapter for Gpt2Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.bpe.encode_with_special_tokens(text))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.bpe.decode(ids.to_vec()).map_err(|e| Error::Tokenization {
            reason: e.to_string(),
        })
    }

    fn pad_token_id(&self) -> u32 {
        DEFAULT_PAD_TOKEN_ID
    }

    fn vocab_size(&self) -> usize {
        GPT2_VOCAB_SIZE
    }
}

/// Builds a tokenizer from a spec string: `tiktoken:gpt2` or a tokenizer directory.
pub fn load_tokenizer(spec: &str) -> Result<Box<dyn TokenizerAdapter>> {
    if spec == TIKTOKEN_GPT2 {
        Ok(Box::new(Gpt2Tokenizer::new()?))
    } else {
        Ok(Box::new(BpeTokenizer::load(spec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::word_level_tokenizer_dir;
    use anyhow::Result;
    use rstest::*;
    use tempfile::TempDir;

    #[fixture]
    fn tokenizer_dir() -> TempDir {
        word_level_tokenizer_dir().unwrap()
    }

    #[rstest]
    fn test_bpe_tokenizer_load_tokenizer_json(tokenizer_dir: TempDir) -> Result<()> {
        let tokenizer = BpeTokenizer::load(tokenizer_dir.path())?;
        let ids = tokenizer.encode("the cat sat")?;

        assert_eq!(ids.len(), 3);
        assert_eq!(tokenizer.pad_token_id(), 0);
        assert_eq!(tokenizer.decode(&ids)?, "the cat sat");
        Ok(())
    }

    #[rstest]
    fn test_bpe_tokenizer_empty_text(tokenizer_dir: TempDir) -> Result<()> {
        let tokenizer = BpeTokenizer::load(tokenizer_dir.path())?;
        assert!(tokenizer.encode("")?.is_empty());
        Ok(())
    }

    #[rstest]
    fn test_missing_tokenizer_artifact() -> Result<()> {
        let dir = TempDir::new()?;
        let err = BpeTokenizer::load(dir.path()).err().unwrap();
        assert_eq!(err.kind(), "TokenizerLoadError");
        Ok(())
    }

    #[rstest]
    fn test_malformed_tokenizer_artifact() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join(TOKENIZER_FILENAME), "{ not json")?;
        let err = BpeTokenizer::load(dir.path()).err().unwrap();
        assert!(matches!(err, Error::TokenizerLoad { .. }));
        Ok(())
    }

    #[rstest]
    fn test_gpt2_tokenizer_roundtrip() -> Result<()> {
        let tokenizer = load_tokenizer(TIKTOKEN_GPT2)?;
        let txt = "In the heart of the city";
        let ids = tokenizer.encode(txt)?;

        assert_eq!(tokenizer.decode(&ids)?, txt);
        assert_eq!(tokenizer.pad_token_id(), DEFAULT_PAD_TOKEN_ID);
        assert_eq!(tokenizer.vocab_size(), 50_257);
        Ok(())
    }
}
