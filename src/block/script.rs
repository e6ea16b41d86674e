//! Signature-script push parsing
//!
//! The extractor's fast path only ever needs the first data push of a
//! scriptSig, so [`pop_push`] handles direct pushes (opcodes 1..=75) and
//! nothing else. [`pushed_data`] walks a whole script and accepts the
//! `OP_PUSHDATA` forms; it is used on the recovery path where those are
//! legal.

use bitcoin::script::Instruction;
use bitcoin::Script;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushParseError {
    #[error("empty script")]
    EmptyScript,
    #[error("push of {wanted} bytes but only {have} remain")]
    ShortScript { wanted: usize, have: usize },
    #[error("OP_PUSHDATA{0} is not handled by the minimal parser")]
    UnsupportedPushdata(u8),
    #[error("opcode 0x{0:02x} is not a data push")]
    NotADataPush(u8),
}

/// Pop the leading data push off a script.
///
/// Returns the push payload and the unconsumed remainder. Nearly all
/// early-chain scriptSigs start with a short direct push (the DER
/// signature), so anything else is rejected and left to the caller to
/// skip.
pub fn pop_push(script: &[u8]) -> Result<(&[u8], &[u8]), PushParseError> {
    let (&op, rest) = script.split_first().ok_or(PushParseError::EmptyScript)?;

    match op {
        // OP_PUSHBYTES_1 to OP_PUSHBYTES_75
        1..=75 => {
            let len = op as usize;
            if rest.len() < len {
                return Err(PushParseError::ShortScript {
                    wanted: len,
                    have: rest.len(),
                });
            }
            Ok(rest.split_at(len))
        }
        // OP_PUSHDATA1 / OP_PUSHDATA2 / OP_PUSHDATA4
        0x4c => Err(PushParseError::UnsupportedPushdata(1)),
        0x4d => Err(PushParseError::UnsupportedPushdata(2)),
        0x4e => Err(PushParseError::UnsupportedPushdata(4)),
        other => Err(PushParseError::NotADataPush(other)),
    }
}

/// All push payloads of a script, `OP_PUSHDATA1/2/4` included.
///
/// Fails if the script is malformed (a push runs past the end).
pub fn pushed_data(script: &Script) -> Result<Vec<Vec<u8>>, bitcoin::script::Error> {
    let mut result = Vec::new();

    for instruction in script.instructions() {
        if let Instruction::PushBytes(bytes) = instruction? {
            result.push(bytes.as_bytes().to_vec());
        }
    }

    Ok(result)
}
