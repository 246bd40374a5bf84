//! Solidity ABI encoding for the handful of calls the worker makes.

use veritas_core::{keccak256, Address, Result, VeritasError, B256};

/// A value to be ABI-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(u128),
    Bool(bool),
    Address(Address),
    FixedBytes(B256),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::String(_) | Token::Array(_) => true,
            Token::Tuple(items) => items.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    fn head_size(&self) -> usize {
        match self {
            Token::Tuple(items) if !self.is_dynamic() => items.iter().map(Token::head_size).sum(),
            _ => 32,
        }
    }
}

/// First four bytes of the keccak of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

/// Topic hash of an event signature.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// Calldata for `signature` applied to `args`.
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode(args));
    data
}

/// Encode `tokens` as a top-level parameter list.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len: usize = tokens.iter().map(Token::head_size).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            tail.extend(encode_token(token));
        } else {
            head.extend(encode_token(token));
        }
    }

    head.extend(tail);
    head
}

fn encode_token(token: &Token) -> Vec<u8> {
    match token {
        Token::Uint(v) => uint_word(*v).to_vec(),
        Token::Bool(b) => uint_word(u128::from(*b)).to_vec(),
        Token::Address(a) => {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(a.as_bytes());
            word.to_vec()
        }
        Token::FixedBytes(b) => b.as_bytes().to_vec(),
        Token::Bytes(bytes) => encode_bytes(bytes),
        Token::String(s) => encode_bytes(s.as_bytes()),
        Token::Array(items) => {
            let mut out = uint_word(items.len() as u128).to_vec();
            out.extend(encode(items));
            out
        }
        Token::Tuple(items) => encode(items),
    }
}

fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = uint_word(bytes.len() as u128).to_vec();
    out.extend_from_slice(bytes);
    let padding = (32 - bytes.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Reads words out of ABI-encoded return data.
pub struct AbiReader<'a> {
    data: &'a [u8],
}

impl<'a> AbiReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// The 32-byte word starting at byte `offset`.
    pub fn word(&self, offset: usize) -> Result<&'a [u8]> {
        let end = offset_add(offset, 32usize)?;
        self.data
            .get(offset..end)
            .ok_or_else(|| VeritasError::Ledger(format!("return data too short at offset {offset}")))
    }

    /// Offset of a dynamic value: `base` plus the relative offset stored at `pointer`.
    pub fn offset(&self, base: usize, pointer: usize) -> Result<usize> {
        offset_add(base, self.uint(pointer)?)
    }

    pub fn uint(&self, offset: usize) -> Result<u64> {
        let word = self.word(offset)?;
        if word[..24].iter().any(|b| *b != 0) {
            return Err(VeritasError::Ledger(format!("uint at offset {offset} exceeds 64 bits")));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&word[24..]);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn boolean(&self, offset: usize) -> Result<bool> {
        Ok(self.uint(offset)? != 0)
    }

    pub fn address(&self, offset: usize) -> Result<Address> {
        Address::from_slice(&self.word(offset)?[12..])
    }

    pub fn fixed_bytes(&self, offset: usize) -> Result<B256> {
        B256::from_slice(self.word(offset)?)
    }

    /// Dynamic `string` whose relative offset is stored at `pointer`,
    /// measured from `base`.
    pub fn string(&self, base: usize, pointer: usize) -> Result<String> {
        let start = self.offset(base, pointer)?;
        let body = offset_add(start, 32usize)?;
        let end = offset_add(body, self.uint(start)?)?;
        let bytes = self
            .data
            .get(body..end)
            .ok_or_else(|| VeritasError::Ledger("string runs past return data".to_string()))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| VeritasError::Ledger(format!("string is not utf-8: {e}")))
    }
}

/// `base + delta` for offsets taken from untrusted return data.
pub fn offset_add(base: usize, delta: impl TryInto<usize>) -> Result<usize> {
    delta
        .try_into()
        .ok()
        .and_then(|delta| base.checked_add(delta))
        .ok_or_else(|| VeritasError::Ledger(format!("offset overflows past {base}")))
}
