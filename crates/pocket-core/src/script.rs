//! Minimal script helpers. Scripts are opaque to validation except for the
//! few patterns the node needs to recognise: sigop counting, pay-to-pubkey
//! outputs owned by a staking key, and `OP_RETURN` data carriers.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_TRUE: u8 = 0x51;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Sigops charged for a bare multisig opcode.
pub const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// Single parsed instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

/// Iterate instructions, stopping at the first malformed push.
pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions { script, pos: 0 }
}

pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let op = *self.script.get(self.pos)?;
        self.pos += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *self.script.get(self.pos)? as usize;
                self.pos += 1;
                n
            }
            OP_PUSHDATA2 => {
                let b = self.script.get(self.pos..self.pos + 2)?;
                self.pos += 2;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = self.script.get(self.pos..self.pos + 4)?;
                self.pos += 4;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            _ => return Some(Instruction::Op(op)),
        };
        let data = self.script.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(Instruction::Push(data))
    }
}

pub fn count_sigops(script: &[u8]) -> u32 {
    instructions(script)
        .map(|ins| match ins {
            Instruction::Op(OP_CHECKSIG) | Instruction::Op(OP_CHECKSIGVERIFY) => 1,
            Instruction::Op(OP_CHECKMULTISIG) | Instruction::Op(OP_CHECKMULTISIGVERIFY) => {
                MAX_PUBKEYS_PER_MULTISIG
            }
            _ => 0,
        })
        .sum()
}

/// `<32-byte key> OP_CHECKSIG`
pub fn p2pk(pubkey: &[u8; 32]) -> Vec<u8> {
    let mut script = Vec::with_capacity(34);
    script.push(32);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn extract_p2pk(script: &[u8]) -> Option<[u8; 32]> {
    if script.len() != 34 || script[0] != 32 || script[33] != OP_CHECKSIG {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&script[1..33]);
    Some(key)
}

/// Builds `OP_RETURN <push>...` from data chunks (each < 76 bytes).
pub fn op_return(chunks: &[&[u8]]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    for chunk in chunks {
        push_data(&mut script, chunk);
    }
    script
}

pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0..=0x4b => script.push(data.len() as u8),
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
        }
        _ => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Data pushes following a leading `OP_RETURN`, or `None` for other scripts.
pub fn op_return_pushes(script: &[u8]) -> Option<Vec<&[u8]>> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }
    Some(
        instructions(&script[1..])
            .filter_map(|ins| match ins {
                Instruction::Push(data) => Some(data),
                Instruction::Op(_) => None,
            })
            .collect(),
    )
}
