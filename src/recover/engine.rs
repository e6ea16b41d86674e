//! Minimal legacy script interpreter
//!
//! The recovery path needs to replay a scriptSig against a P2PKH
//! pkScript just far enough that the next opcode is `OP_CHECKSIG`, then
//! read the signature and pubkey off the evaluation stack and rebuild
//! the exact subscript that the sighash covered. Only the opcodes that
//! appear on that path are implemented; anything else stops the replay
//! and the record is skipped.

use crate::recover::hash160;
use anyhow::{Context, Result};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CODESEPARATOR, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160, OP_NOP,
};
use bitcoin::sighash::SighashCache;
use bitcoin::{Script, Transaction};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("malformed script: push at offset {0} runs past the end")]
    MalformedPush(usize),
    #[error("stack underflow at opcode 0x{0:02x}")]
    StackUnderflow(u8),
    #[error("OP_EQUALVERIFY failed")]
    EqualVerifyFailed,
    #[error("opcode 0x{0:02x} is not supported by the replay engine")]
    UnsupportedOpcode(u8),
    #[error("script ended before OP_CHECKSIG")]
    NoCheckSig,
}

/// One tokenized script element with its byte span in the source script.
#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    span: Range<usize>,
}

#[derive(Debug, Clone)]
enum TokenKind {
    Push(Vec<u8>),
    Op(u8),
}

/// Tokenize a script, keeping byte spans so subscripts can be rebuilt
/// from the original bytes.
fn tokenize(script: &[u8]) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut offset = 0usize;

    while offset < script.len() {
        let opcode = script[offset];
        let start = offset;

        let (data_start, len) = match opcode {
            // Direct pushes; OP_0 pushes the empty vector.
            0x00 => (offset + 1, 0),
            0x01..=0x4b => (offset + 1, opcode as usize),
            // OP_PUSHDATA1
            0x4c => {
                if offset + 2 > script.len() {
                    return Err(EngineError::MalformedPush(start));
                }
                (offset + 2, script[offset + 1] as usize)
            }
            // OP_PUSHDATA2
            0x4d => {
                if offset + 3 > script.len() {
                    return Err(EngineError::MalformedPush(start));
                }
                let len = u16::from_le_bytes([script[offset + 1], script[offset + 2]]) as usize;
                (offset + 3, len)
            }
            // OP_PUSHDATA4
            0x4e => {
                if offset + 5 > script.len() {
                    return Err(EngineError::MalformedPush(start));
                }
                let len = u32::from_le_bytes([
                    script[offset + 1],
                    script[offset + 2],
                    script[offset + 3],
                    script[offset + 4],
                ]) as usize;
                (offset + 5, len)
            }
            op => {
                tokens.push(Token {
                    kind: TokenKind::Op(op),
                    span: start..start + 1,
                });
                offset += 1;
                continue;
            }
        };

        let end = data_start + len;
        if end > script.len() {
            return Err(EngineError::MalformedPush(start));
        }
        tokens.push(Token {
            kind: TokenKind::Push(script[data_start..end].to_vec()),
            span: start..end,
        });
        offset = end;
    }

    Ok(tokens)
}

/// Replay state for one input: scriptSig first, then the pkScript.
pub struct ScriptEngine<'a> {
    pk_script: &'a [u8],
    scripts: [Vec<Token>; 2],
    phase: usize,
    pc: usize,
    stack: Vec<Vec<u8>>,
    /// Offset in pk_script just past the last executed OP_CODESEPARATOR.
    last_codesep: usize,
}

impl<'a> ScriptEngine<'a> {
    pub fn new(sig_script: &[u8], pk_script: &'a [u8]) -> Result<Self, EngineError> {
        Ok(Self {
            pk_script,
            scripts: [tokenize(sig_script)?, tokenize(pk_script)?],
            phase: 0,
            pc: 0,
            stack: Vec::new(),
            last_codesep: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        let mut phase = self.phase;
        let mut pc = self.pc;
        while phase < 2 {
            if pc < self.scripts[phase].len() {
                return Some(&self.scripts[phase][pc]);
            }
            phase += 1;
            pc = 0;
        }
        None
    }

    /// Whether the next opcode to execute is `op`.
    pub fn next_is(&self, op: bitcoin::opcodes::Opcode) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Op(code), .. }) if *code == op.to_u8())
    }

    pub fn stack(&self) -> &[Vec<u8>] {
        &self.stack
    }

    /// pkScript bytes since the last executed OP_CODESEPARATOR.
    pub fn subscript(&self) -> &'a [u8] {
        &self.pk_script[self.last_codesep..]
    }

    /// Execute a single opcode.
    pub fn step(&mut self) -> Result<(), EngineError> {
        while self.phase < 2 && self.pc >= self.scripts[self.phase].len() {
            self.phase += 1;
            self.pc = 0;
        }
        let Some(token) = self
            .scripts
            .get(self.phase)
            .and_then(|s| s.get(self.pc))
            .cloned()
        else {
            return Err(EngineError::NoCheckSig);
        };
        self.pc += 1;

        match token.kind {
            TokenKind::Push(data) => self.stack.push(data),
            TokenKind::Op(op) if op == OP_DUP.to_u8() => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or(EngineError::StackUnderflow(op))?;
                self.stack.push(top);
            }
            TokenKind::Op(op) if op == OP_HASH160.to_u8() => {
                let top = self.stack.pop().ok_or(EngineError::StackUnderflow(op))?;
                self.stack.push(hash160(&top).to_vec());
            }
            TokenKind::Op(op) if op == OP_EQUAL.to_u8() || op == OP_EQUALVERIFY.to_u8() => {
                if self.stack.len() < 2 {
                    return Err(EngineError::StackUnderflow(op));
                }
                let a = self.stack.pop().expect("checked");
                let b = self.stack.pop().expect("checked");
                let equal = a == b;
                if op == OP_EQUALVERIFY.to_u8() {
                    if !equal {
                        return Err(EngineError::EqualVerifyFailed);
                    }
                } else {
                    self.stack.push(if equal { vec![1] } else { vec![] });
                }
            }
            TokenKind::Op(op) if op == OP_CODESEPARATOR.to_u8() => {
                if self.phase == 1 {
                    self.last_codesep = token.span.end;
                }
            }
            TokenKind::Op(op) if op == OP_NOP.to_u8() => {}
            TokenKind::Op(op) => return Err(EngineError::UnsupportedOpcode(op)),
        }

        Ok(())
    }

    /// Step until the next opcode is `OP_CHECKSIG`.
    pub fn run_to_checksig(&mut self) -> Result<(), EngineError> {
        while !self.next_is(OP_CHECKSIG) {
            self.step()?;
        }
        Ok(())
    }
}

/// Remove every push of `sig` from a subscript, per the sighash rule,
/// rebuilding from the original bytes of the remaining tokens.
pub fn remove_sig_pushes(subscript: &[u8], sig: &[u8]) -> Result<Vec<u8>, EngineError> {
    let tokens = tokenize(subscript)?;
    let mut out = Vec::with_capacity(subscript.len());

    for token in tokens {
        if let TokenKind::Push(data) = &token.kind {
            if data.as_slice() == sig {
                continue;
            }
        }
        out.extend_from_slice(&subscript[token.span]);
    }

    Ok(out)
}

/// The sighash digest a legacy signature over this input committed to.
pub fn legacy_sighash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    hash_type: u8,
) -> Result<[u8; 32]> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(
            input_index,
            Script::from_bytes(subscript),
            hash_type as u32,
        )
        .with_context(|| format!("sighash for input {}", input_index))?;
    Ok(sighash.to_byte_array())
}
