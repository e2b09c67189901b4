use alloy_signer_local::MnemonicBuilder;
use alloy_signer_local::coins_bip39::English;

use crate::error::{Error, Result};

/// Derive the secp256k1 key at `m/44'/60'/0'/0/{index}` and render it as
/// `0x` followed by 64 lowercase hex digits.
pub fn derive_private_key_hex(mnemonic: &str, index: u32) -> Result<String> {
    let phrase = mnemonic.split_whitespace().collect::<Vec<_>>().join(" ");
    if phrase.is_empty() {
        return Err(Error::msg("mnemonic is empty"));
    }
    let signer = MnemonicBuilder::<English>::default()
        .phrase(phrase)
        .index(index)
        .and_then(|b| b.build())
        .map_err(|e| Error::msg(format!("derive key at index {index}: {e}")))?;
    Ok(format!("0x{}", hex::encode(signer.to_bytes())))
}
