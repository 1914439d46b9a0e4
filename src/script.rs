//! HTLC redeem-script construction and validation.
//!
//! Both swap directions use the same script shape; only which party controls the
//! claim branch vs. the refund branch differs:
//!
//! - Loop-out: we hold the claim key (preimage + our signature); the counterparty
//!   holds the refund key (their signature after `timeout`).
//! - Loop-in: the counterparty holds the claim key; we hold the refund key.
//!
//! `OP_SIZE 32 OP_EQUAL OP_IF OP_SHA256 <payment_hash> OP_EQUALVERIFY <claim_pubkey>
//! OP_ELSE OP_DROP <timeout> OP_CLTV OP_DROP <refund_pubkey> OP_ENDIF OP_CHECKSIG` — a
//! 32-byte witness element routes through the claim branch; anything else (an empty
//! push) is dropped and falls through to the refund branch.

use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::{Address, Network, PublicKey, Script, ScriptBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::types::{BlockHeight, PaymentHash};

/// Decode a minimally-encoded script number (little-endian magnitude, high bit of
/// the last byte is the sign), the inverse of `Builder::push_int`.
fn decode_minimal_scriptint(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut result: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        result |= (byte as i64) << (8 * i);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        result &= !(0x80i64 << (8 * (bytes.len() - 1)));
        result = -result;
    }
    result
}

/// Which side of the script we expect to control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Claim,
    Refund,
}

/// A parsed or freshly-built HTLC redeem script plus the fields it commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemScript {
    script: ScriptBuf,
    payment_hash: PaymentHash,
    claim_pubkey: PublicKey,
    refund_pubkey: PublicKey,
    timeout: BlockHeight,
}

/// Persisted as the raw script hex; every other field is recovered by reparsing it,
/// so there's no risk of the stored fields drifting from the script bytes.
impl Serialize for RedeemScript {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.script.to_hex_string())
    }
}

impl<'de> Deserialize<'de> for RedeemScript {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        RedeemScript::from_script(ScriptBuf::from_bytes(bytes)).map_err(serde::de::Error::custom)
    }
}

impl RedeemScript {
    /// Build the redeem script for a loop-out (reverse) swap: we are the claimant.
    pub fn new_loop_out(
        payment_hash: PaymentHash,
        our_claim_pubkey: PublicKey,
        counterparty_refund_pubkey: PublicKey,
        timeout: BlockHeight,
    ) -> Self {
        Self::build(
            payment_hash,
            our_claim_pubkey,
            counterparty_refund_pubkey,
            timeout,
        )
    }

    /// Build the redeem script for a loop-in (forward) swap: we are the refunder.
    pub fn new_loop_in(
        payment_hash: PaymentHash,
        counterparty_claim_pubkey: PublicKey,
        our_refund_pubkey: PublicKey,
        timeout: BlockHeight,
    ) -> Self {
        Self::build(
            payment_hash,
            counterparty_claim_pubkey,
            our_refund_pubkey,
            timeout,
        )
    }

    fn build(
        payment_hash: PaymentHash,
        claim_pubkey: PublicKey,
        refund_pubkey: PublicKey,
        timeout: BlockHeight,
    ) -> Self {
        let script = Builder::new()
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_SHA256)
            .push_slice(payment_hash.as_bytes())
            .push_opcode(OP_EQUALVERIFY)
            .push_key(&claim_pubkey)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(timeout.0 as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&refund_pubkey)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script();

        Self {
            script,
            payment_hash,
            claim_pubkey,
            refund_pubkey,
            timeout,
        }
    }

    /// Parse a redeem script handed to us by the counterparty, extracting its
    /// committed fields so they can be checked against our own expectations.
    pub fn from_script(script: ScriptBuf) -> Result<Self> {
        let instructions: Vec<Instruction> = script
            .instructions()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Transaction(format!("malformed redeem script: {e}")))?;

        let malformed = || Error::Transaction("redeem script does not match the expected HTLC template".to_string());

        let push_bytes = |instr: &Instruction| -> Result<Vec<u8>> {
            match instr {
                Instruction::PushBytes(b) => Ok(b.as_bytes().to_vec()),
                _ => Err(malformed()),
            }
        };

        let push_int = |instr: &Instruction| -> Result<i64> {
            match instr {
                Instruction::PushBytes(b) => Ok(decode_minimal_scriptint(b.as_bytes())),
                Instruction::Op(op) => {
                    let v = op.to_u8();
                    if (0x51..=0x60).contains(&v) {
                        Ok((v - 0x50) as i64)
                    } else {
                        Err(malformed())
                    }
                }
            }
        };

        if instructions.len() != 16 {
            return Err(malformed());
        }

        if instructions[0] != Instruction::Op(OP_SIZE) {
            return Err(malformed());
        }
        if push_int(&instructions[1])? != 32 {
            return Err(malformed());
        }
        if instructions[2] != Instruction::Op(OP_EQUAL) {
            return Err(malformed());
        }
        if instructions[3] != Instruction::Op(OP_IF) {
            return Err(malformed());
        }
        if instructions[4] != Instruction::Op(OP_SHA256) {
            return Err(malformed());
        }
        let hash_bytes = push_bytes(&instructions[5])?;
        let payment_hash = PaymentHash::from_bytes(
            hash_bytes
                .try_into()
                .map_err(|_| malformed())?,
        );
        if instructions[6] != Instruction::Op(OP_EQUALVERIFY) {
            return Err(malformed());
        }
        let claim_pubkey = PublicKey::from_slice(&push_bytes(&instructions[7])?)
            .map_err(|_| malformed())?;
        if instructions[8] != Instruction::Op(OP_ELSE) {
            return Err(malformed());
        }
        if instructions[9] != Instruction::Op(OP_DROP) {
            return Err(malformed());
        }
        let timeout = push_int(&instructions[10])?;
        if timeout < 0 {
            return Err(malformed());
        }
        if instructions[11] != Instruction::Op(OP_CLTV) {
            return Err(malformed());
        }
        if instructions[12] != Instruction::Op(OP_DROP) {
            return Err(malformed());
        }
        let refund_pubkey = PublicKey::from_slice(&push_bytes(&instructions[13])?)
            .map_err(|_| malformed())?;
        if instructions[14] != Instruction::Op(OP_ENDIF) {
            return Err(malformed());
        }
        if instructions[15] != Instruction::Op(OP_CHECKSIG) {
            return Err(malformed());
        }

        Ok(Self {
            script,
            payment_hash,
            claim_pubkey,
            refund_pubkey,
            timeout: BlockHeight(timeout as u32),
        })
    }

    /// Check that this script commits to the payment hash and timeout we expect,
    /// and that our own key is the expected key on our branch. Refuse the swap on
    /// any mismatch before taking any on-chain action.
    pub fn validate_against(
        &self,
        expected_payment_hash: PaymentHash,
        expected_own_pubkey: &PublicKey,
        own_branch: Branch,
        expected_timeout: BlockHeight,
    ) -> Result<()> {
        if self.payment_hash != expected_payment_hash {
            return Err(Error::Transaction(format!(
                "redeem script hash-lock {} does not match expected payment hash {}",
                self.payment_hash, expected_payment_hash
            )));
        }
        if self.timeout != expected_timeout {
            return Err(Error::Transaction(format!(
                "redeem script timeout {} does not match declared timeout {}",
                self.timeout, expected_timeout
            )));
        }
        let own_key = match own_branch {
            Branch::Claim => &self.claim_pubkey,
            Branch::Refund => &self.refund_pubkey,
        };
        if own_key != expected_own_pubkey {
            return Err(Error::Transaction(format!(
                "redeem script does not grant our key ({expected_own_pubkey}) the {own_branch:?} branch"
            )));
        }
        Ok(())
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    pub fn claim_pubkey(&self) -> PublicKey {
        self.claim_pubkey
    }

    pub fn refund_pubkey(&self) -> PublicKey {
        self.refund_pubkey
    }

    pub fn timeout(&self) -> BlockHeight {
        self.timeout
    }

    /// The native-segwit P2WSH scriptPubKey committing to this redeem script.
    pub fn to_p2wsh(&self) -> ScriptBuf {
        self.script.to_p2wsh()
    }

    /// The nested (P2SH-wrapped) P2WSH scriptPubKey, for counterparties that fund
    /// through a wrapped-segwit address.
    pub fn to_p2sh_p2wsh(&self) -> ScriptBuf {
        self.script.to_p2wsh().to_p2sh()
    }

    /// The bech32 address for the native P2WSH scriptPubKey.
    pub fn address(&self, network: Network) -> Result<Address> {
        Address::from_script(&self.to_p2wsh(), network)
            .map_err(|e| Error::Transaction(format!("cannot derive address: {e}")))
    }

    /// Witness script hash, for callers building a P2WSH output directly.
    pub fn wscript_hash(&self) -> bitcoin::WScriptHash {
        self.script.wscript_hash()
    }
}
