//! Pairwise collation
//!
//! Turns preference pairs into fixed-shape id and mask tensors, and provides
//! the batch sampling used by training and evaluation.

use crate::data::{PreferenceDataset, PreferenceExample};
use crate::error::{Error, Result};
use crate::tokenizer::{TokenizerAdapter, DEFAULT_PAD_TOKEN_ID};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Truncates or right-pads `ids` to exactly `block_size` entries.
///
/// The returned mask is `true` for real tokens and `false` for padding.
pub fn encode_to_block(
    ids: &[u32],
    block_size: usize,
    pad_token_id: u32,
) -> (Vec<u32>, Vec<bool>) {
    let n_real = ids.len().min(block_size);
    let mut block = ids[..n_real].to_vec();
    block.resize(block_size, pad_token_id);
    let mask = (0..block_size).map(|ix| ix < n_real).collect();
    (block, mask)
}

/// Both sides of a `PreferenceExample`, tokenized to `block_size`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPair {
    pub chosen_ids: Vec<u32>,
    pub chosen_mask: Vec<bool>,
    pub rejected_ids: Vec<u32>,
    pub rejected_mask: Vec<bool>,
}

impl EncodedPair {
    pub fn from_example<T: TokenizerAdapter + ?Sized>(
        example: &PreferenceExample,
        block_size: usize,
        tokenizer: &T,
    ) -> Result<Self> {
        Self::encode(example, block_size, tokenizer.pad_token_id(), tokenizer)
    }

    fn encode<T: TokenizerAdapter + ?Sized>(
        example: &PreferenceExample,
        block_size: usize,
        pad_token_id: u32,
        tokenizer: &T,
    ) -> Result<Self> {
        let chosen = tokenizer.encode(example.chosen())?;
        let rejected = tokenizer.encode(example.rejected())?;
        let (chosen_ids, chosen_mask) = encode_to_block(&chosen, block_size, pad_token_id);
        let (rejected_ids, rejected_mask) = encode_to_block(&rejected, block_size, pad_token_id);
        Ok(Self {
            chosen_ids,
            chosen_mask,
            rejected_ids,
            rejected_mask,
        })
    }
}

/// Stacked `EncodedPair`s, index-aligned between the two sides.
///
/// Ids are `u32` and masks are `u8` (0/1), all of shape `(batch, block_size)`.
#[derive(Debug, Clone)]
pub struct Batch {
    chosen_ids: Tensor,
    chosen_mask: Tensor,
    rejected_ids: Tensor,
    rejected_mask: Tensor,
}

impl Batch {
    pub fn from_pairs(pairs: &[EncodedPair], device: &Device) -> Result<Self> {
        let first = pairs.first().ok_or_else(|| Error::Collation {
            reason: "cannot collate an empty batch".to_string(),
        })?;
        let shape = (pairs.len(), first.chosen_ids.len());
        let chosen_ids = pairs.iter().map(|p| p.chosen_ids.as_slice());
        let chosen_mask = pairs.iter().map(|p| p.chosen_mask.as_slice());
        let rejected_ids = pairs.iter().map(|p| p.rejected_ids.as_slice());
        let rejected_mask = pairs.iter().map(|p| p.rejected_mask.as_slice());
        Ok(Self {
            chosen_ids: stack_ids(chosen_ids, shape, device)?,
            chosen_mask: stack_mask(chosen_mask, shape, device)?,
            rejected_ids: stack_ids(rejected_ids, shape, device)?,
            rejected_mask: stack_mask(rejected_mask, shape, device)?,
        })
    }

    pub fn chosen_ids(&self) -> &Tensor {
        &self.chosen_ids
    }

    pub fn chosen_mask(&self) -> &Tensor {
        &self.chosen_mask
    }

    pub fn rejected_ids(&self) -> &Tensor {
        &self.rejected_ids
    }

    pub fn rejected_mask(&self) -> &Tensor {
        &self.rejected_mask
    }

    /// Number of pairs in the batch
    pub fn len(&self) -> usize {
        self.chosen_ids.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stack_ids<'a>(
    rows: impl Iterator<Item = &'a [u32]>,
    shape: (usize, usize),
    device: &Device,
) -> candle_core::Result<Tensor> {
    let flat: Vec<u32> = rows.flatten().copied().collect();
    Tensor::from_vec(flat, shape, device)
}

fn stack_mask<'a>(
    rows: impl Iterator<Item = &'a [bool]>,
    shape: (usize, usize),
    device: &Device,
) -> candle_core::Result<Tensor> {
    let flat: Vec<u8> = rows.flatten().map(|&m| m as u8).collect();
    Tensor::from_vec(flat, shape, device)
}

/// Collates preference pairs into a `Batch`
#[derive(Clone)]
pub struct PairwiseCollator {
    block_size: usize,
    pad_token_id: u32,
    device: Device,
}

impl Default for PairwiseCollator {
    fn default() -> Self {
        Self {
            block_size: 256,
            pad_token_id: DEFAULT_PAD_TOKEN_ID,
            device: Device::Cpu,
        }
    }
}

impl PairwiseCollator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Pads with this collator's `pad_token_id` rather than the tokenizer's.
    pub fn collate<T: TokenizerAdapter + ?Sized>(
        &self,
        examples: &[PreferenceExample],
        tokenizer: &T,
    ) -> Result<Batch> {
        if examples.is_empty() {
            return Err(Error::Collation {
                reason: "cannot collate an empty batch".to_string(),
            });
        }
        let pairs = examples
            .iter()
            .map(|example| {
                EncodedPair::encode(example, self.block_size, self.pad_token_id, tokenizer)
            })
            .collect::<Result<Vec<_>>>()?;
        Batch::from_pairs(&pairs, &self.device)
    }
}

/// Collates `examples` using the tokenizer's pad token.
pub fn collate<T: TokenizerAdapter + ?Sized>(
    examples: &[PreferenceExample],
    block_size: usize,
    tokenizer: &T,
    device: &Device,
) -> Result<Batch> {
    PairwiseCollator::new()
        .block_size(block_size)
        .pad_token_id(tokenizer.pad_token_id())
        .device(device.clone())
        .collate(examples, tokenizer)
}

/// Endless stream of dataset indices, reshuffled at the start of every epoch.
pub struct PairSampler {
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl PairSampler {
    pub fn new(len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Self {
            rng,
            order,
            cursor: 0,
        }
    }

    /// Draws `n` indices, starting a new epoch whenever the current one runs out.
    pub fn sample(&mut self, n: usize) -> Vec<usize> {
        if self.order.is_empty() {
            return vec![];
        }
        (0..n).map(|_| self.next_index()).collect()
    }

    /// Skips `n` draws, leaving the sampler where `sample(n)` would.
    pub fn advance(&mut self, n: usize) {
        if self.order.is_empty() {
            return;
        }
        for _ in 0..n {
            self.next_index();
        }
    }

    fn next_index(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let ix = self.order[self.cursor];
        self.cursor += 1;
        ix
    }
}

/// Batches a `PreferenceDataset` for training and evaluation
pub struct PreferenceDataLoader {
    dataset: PreferenceDataset,
    collator: PairwiseCollator,
    batch_size: usize,
    sampler: PairSampler,
}

impl PreferenceDataLoader {
    pub fn new(
        dataset: PreferenceDataset,
        collator: PairwiseCollator,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        let sampler = PairSampler::new(dataset.len(), seed);
        Self {
            dataset,
            collator,
            batch_size,
            sampler,
        }
    }

    /// Discards the next `n_batches` training batches without encoding them.
    pub fn skip_batches(&mut self, n_batches: usize) {
        self.sampler.advance(n_batches * self.batch_size);
    }

    /// Next training batch of exactly `batch_size` pairs, cycling the dataset.
    pub fn train_batch<T: TokenizerAdapter + ?Sized>(
        &mut self,
        tokenizer: &T,
    ) -> Result<Batch> {
        let examples: Vec<PreferenceExample> = self
            .sampler
            .sample(self.batch_size)
            .into_iter()
            .filter_map(|ix| self.dataset.get_item_at_index(ix).cloned())
            .collect();
        self.collator.collate(&examples, tokenizer)
    }

    /// Sequential, unshuffled batches over the whole dataset.
    pub fn eval_batches<'a, T: TokenizerAdapter + ?Sized>(
        &'a self,
        tokenizer: &'a T,
    ) -> impl Iterator<Item = Result<Batch>> + 'a {
        self.dataset
            .data()
            .chunks(self.batch_size.max(1))
            .map(move |chunk| self.collator.collate(chunk, tokenizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fallback_examples;
    use crate::test_utils::word_level_tokenizer_dir;
    use crate::tokenizer::BpeTokenizer;
    use anyhow::Result;
    use rstest::*;

    #[fixture]
    fn tokenizer() -> BpeTokenizer {
        let dir = word_level_tokenizer_dir().unwrap();
        BpeTokenizer::load(dir.path()).unwrap()
    }

    #[rstest]
    #[case(&[5, 6, 7], 5, vec![5, 6, 7, 0, 0], 3)]
    #[case(&[5, 6, 7, 8, 9, 10], 4, vec![5, 6, 7, 8], 4)]
    #[case(&[], 3, vec![0, 0, 0], 0)]
    fn test_encode_to_block(
        #[case] ids: &[u32],
        #[case] block_size: usize,
        #[case] expected: Vec<u32>,
        #[case] n_real: usize,
    ) {
        let (block, mask) = encode_to_block(ids, block_size, 0);
        assert_eq!(block, expected);
        assert_eq!(mask.len(), block_size);
        assert_eq!(mask.iter().filter(|m| **m).count(), n_real);
        assert!(mask[..n_real].iter().all(|m| *m));
    }

    #[rstest]
    #[case(2)]
    #[case(8)]
    #[case(64)]
    fn test_collate_shape(tokenizer: BpeTokenizer, #[case] block_size: usize) -> Result<()> {
        let examples = fallback_examples();
        let batch = collate(&examples, block_size, &tokenizer, &Device::Cpu)?;

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.chosen_ids().dims(), &[2, block_size]);
        assert_eq!(batch.rejected_ids().dims(), &[2, block_size]);
        assert_eq!(batch.chosen_mask().dims(), &[2, block_size]);
        assert_eq!(batch.rejected_mask().dims(), &[2, block_size]);
        Ok(())
    }

    #[rstest]
    fn test_collate_padding_and_mask(tokenizer: BpeTokenizer) -> Result<()> {
        let example = PreferenceExample::new("the cat sat", "the dog ran on the mat")?;
        let batch = collate(&[example], 5, &tokenizer, &Device::Cpu)?;

        let chosen_ids = batch.chosen_ids().squeeze(0)?.to_vec1::<u32>()?;
        let chosen_mask = batch.chosen_mask().squeeze(0)?.to_vec1::<u8>()?;
        assert_eq!(chosen_mask, vec![1, 1, 1, 0, 0]);
        assert_eq!(&chosen_ids[3..], &[0, 0]);

        // truncated to the first five tokens
        let rejected_ids = batch.rejected_ids().squeeze(0)?.to_vec1::<u32>()?;
        let expected = tokenizer.encode("the dog ran on the")?;
        assert_eq!(rejected_ids, expected);
        let rejected_mask = batch.rejected_mask().squeeze(0)?.to_vec1::<u8>()?;
        assert_eq!(rejected_mask, vec![1; 5]);
        Ok(())
    }

    #[rstest]
    fn test_collate_empty_tokenization_is_fully_padded(tokenizer: BpeTokenizer) -> Result<()> {
        let example = PreferenceExample::new(" ", "the cat")?;
        let batch = collate(&[example], 4, &tokenizer, &Device::Cpu)?;

        let mask = batch.chosen_mask().squeeze(0)?.to_vec1::<u8>()?;
        assert_eq!(mask, vec![0, 0, 0, 0]);
        Ok(())
    }

    #[rstest]
    fn test_collate_empty_batch_fails(tokenizer: BpeTokenizer) {
        let err = collate(&[], 4, &tokenizer, &Device::Cpu).err().unwrap();
        assert_eq!(err.kind(), "CollationError");
    }

    #[rstest]
    fn test_pair_sampler_cycles_epochs() {
        let mut sampler = PairSampler::new(3, 42);
        let first_epoch = sampler.sample(3);
        let mut sorted = first_epoch.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2]);

        let next = sampler.sample(7);
        assert_eq!(next.len(), 7);
        assert!(next.iter().all(|ix| *ix < 3));
    }

    #[rstest]
    fn test_pair_sampler_is_seeded() {
        let a = PairSampler::new(10, 7).sample(25);
        let b = PairSampler::new(10, 7).sample(25);
        assert_eq!(a, b);
    }

    #[rstest]
    fn test_train_batch_is_always_full(tokenizer: BpeTokenizer) -> Result<()> {
        let dataset = PreferenceDataset::new(fallback_examples());
        let collator = PairwiseCollator::new().block_size(8).pad_token_id(0);
        let mut loader = PreferenceDataLoader::new(dataset, collator, 3, 0);

        for _ in 0..3 {
            let batch = loader.train_batch(&tokenizer)?;
            assert_eq!(batch.chosen_ids().dims(), &[3, 8]);
        }
        Ok(())
    }

    #[rstest]
    fn test_eval_batches_are_sequential(tokenizer: BpeTokenizer) -> Result<()> {
        let mut data = fallback_examples();
        data.push(PreferenceExample::new("good", "bad")?);
        let dataset = PreferenceDataset::new(data);
        let collator = PairwiseCollator::new().block_size(8).pad_token_id(0);
        let loader = PreferenceDataLoader::new(dataset, collator, 2, 0);

        let sizes = loader
            .eval_batches(&tokenizer)
            .map(|b| b.map(|b| b.len()))
            .collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(sizes, vec![2, 1]);
        Ok(())
    }

    #[rstest]
    fn test_encoded_pair_uses_tokenizer_pad(tokenizer: BpeTokenizer) -> Result<()> {
        let example = PreferenceExample::new("the cat", "a dog ran")?;
        let pair = EncodedPair::from_example(&example, 4, &tokenizer)?;

        assert_eq!(pair.chosen_ids.len(), 4);
        assert_eq!(&pair.chosen_ids[2..], &[tokenizer.pad_token_id(); 2]);
        assert_eq!(pair.chosen_mask, vec![true, true, false, false]);
        let rejected = tokenizer.encode("a dog ran")?;
        assert_eq!(&pair.rejected_ids[..3], rejected.as_slice());
        assert_eq!(pair.rejected_mask, vec![true, true, true, false]);
        Ok(())
    }

    #[rstest]
    fn test_pair_sampler_advance_matches_sample() {
        let mut drawn = PairSampler::new(5, 3);
        let mut skipped = PairSampler::new(5, 3);
        drawn.sample(12);
        skipped.advance(12);
        assert_eq!(drawn.sample(9), skipped.sample(9));
    }

    #[rstest]
    fn test_skip_batches_continues_order(tokenizer: BpeTokenizer) -> Result<()> {
        let data = ["the cat", "a dog", "the mat", "good", "bad"]
            .iter()
            .map(|text| PreferenceExample::new(*text, "is"))
            .collect::<crate::Result<Vec<_>>>()?;
        let collator = PairwiseCollator::new().block_size(4).pad_token_id(0);
        let dataset = PreferenceDataset::new(data);
        let mut fresh = PreferenceDataLoader::new(dataset.clone(), collator.clone(), 2, 11);
        let mut resumed = PreferenceDataLoader::new(dataset, collator, 2, 11);

        for _ in 0..3 {
            fresh.train_batch(&tokenizer)?;
        }
        resumed.skip_batches(3);
        let expected = fresh.train_batch(&tokenizer)?;
        let actual = resumed.train_batch(&tokenizer)?;
        assert_eq!(
            expected.chosen_ids().to_vec2::<u32>()?,
            actual.chosen_ids().to_vec2::<u32>()?
        );
        Ok(())
    }
}
