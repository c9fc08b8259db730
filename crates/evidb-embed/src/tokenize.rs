use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use evidb_core::{Error, Result};

/// XLM-RoBERTa `<pad>` id.
const PAD_ID: u32 = 1;

/// Encode a batch into `[B, max_len]` input-id and attention-mask tensors,
/// truncating or padding every row to `max_len`.
pub fn tokenize_batch(
    tokenizer: &Tokenizer,
    texts: &[String],
    max_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut ids = Vec::with_capacity(texts.len() * max_len);
    let mut mask = Vec::with_capacity(texts.len() * max_len);
    for text in texts {
        let enc = tokenizer
            .encode(text.as_str(), true)
            .map_err(|e| Error::Provider(format!("tokenization failed: {e}")))?;
        let row_ids = enc.get_ids();
        let row_mask = enc.get_attention_mask();
        let take = row_ids.len().min(max_len);
        ids.extend_from_slice(&row_ids[..take]);
        mask.extend_from_slice(&row_mask[..take]);
        ids.extend(std::iter::repeat(PAD_ID).take(max_len - take));
        mask.extend(std::iter::repeat(0u32).take(max_len - take));
    }
    let shape = (texts.len(), max_len);
    let input_ids = Tensor::from_vec(ids, shape, device).map_err(model_err)?;
    let attention_mask = Tensor::from_vec(mask, shape, device).map_err(model_err)?;
    Ok((input_ids, attention_mask))
}

pub(crate) fn model_err(e: impl std::fmt::Display) -> Error {
    Error::Provider(format!("local model: {e}"))
}
