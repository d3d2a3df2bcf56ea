//! Shared helpers for unit tests

use crate::tokenizer::TOKENIZER_FILENAME;
use serde_json::json;
use tempfile::TempDir;

pub const TEST_VOCAB: &[&str] = &[
    "<pad>", "<unk>", "the", "cat", "sat", "on", "mat", "dog", "ran", "good", "bad", "a", "is",
    "capital", "of", "france", "paris", "berlin", "water", "boils", "at", "100", "10", "degrees",
    "celsius", "sea", "level", ".",
];

/// Writes a whitespace word-level `tokenizer.json` into a fresh temp directory.
pub fn word_level_tokenizer_dir() -> anyhow::Result<TempDir> {
    let dir = TempDir::new()?;
    let vocab: serde_json::Map<String, serde_json::Value> = TEST_VOCAB
        .iter()
        .enumerate()
        .map(|(ix, tok)| (tok.to_string(), json!(ix)))
        .collect();
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    });
    std::fs::write(
        dir.path().join(TOKENIZER_FILENAME),
        serde_json::to_string_pretty(&tokenizer)?,
    )?;
    Ok(dir)
}
