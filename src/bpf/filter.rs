//! Classic BPF instruction set.
//!
//! Provides the instruction record shared with the kernel (`struct
//! sock_filter`), the opcode constants used by the compiler, a structural
//! checker equivalent to the kernel's attach-time validation, and a
//! user-space interpreter for running programs against captured frames.

// ---------------------------------------------------------------------------
// FFI type: BPF instruction
// ---------------------------------------------------------------------------

/// A single classic BPF instruction, matching the kernel `struct sock_filter`.
///
/// The layout is:
/// - `code` (u16): opcode composed of class | size | mode
/// - `jt`   (u8):  jump-true offset (relative, for conditional jumps)
/// - `jf`   (u8):  jump-false offset (relative, for conditional jumps)
/// - `k`    (u32): generic constant (immediate value, memory offset, etc.)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

// Compile-time size assertion: sock_filter must be exactly 8 bytes.
const _: () = assert!(std::mem::size_of::<SockFilter>() == 8);

impl std::fmt::Display for SockFilter {
    /// Same shape as `tcpdump -dd`: `{ 0x28, 0, 0, 0x0000000c }`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ 0x{:x}, {}, {}, 0x{:08x} }}", self.code, self.jt, self.jf, self.k)
    }
}

/// Largest program the kernel accepts (`BPF_MAXINSNS`).
pub const MAX_INSNS: usize = 4096;

/// Scratch memory slots (`BPF_MEMWORDS`).
pub const MEM_WORDS: usize = 16;

// ---------------------------------------------------------------------------
// BPF instruction constants (classic BPF)
// ---------------------------------------------------------------------------

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// LD/LDX sizes
pub const BPF_W: u16 = 0x00; // word (32-bit)
pub const BPF_H: u16 = 0x08; // half-word (16-bit)
pub const BPF_B: u16 = 0x10; // byte

// LD/LDX modes
pub const BPF_IMM: u16 = 0x00; // immediate value
pub const BPF_ABS: u16 = 0x20; // absolute offset into packet
pub const BPF_IND: u16 = 0x40; // indirect offset (X + k)
pub const BPF_MEM: u16 = 0x60; // scratch memory load
pub const BPF_LEN: u16 = 0x80; // packet length
pub const BPF_MSH: u16 = 0xa0; // IP header length hack: 4*(data[k] & 0xf)

// ALU operations
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

// JMP operations
pub const BPF_JA: u16 = 0x00; // unconditional jump
pub const BPF_JEQ: u16 = 0x10; // jump if A == operand
pub const BPF_JGT: u16 = 0x20; // jump if A > operand
pub const BPF_JGE: u16 = 0x30; // jump if A >= operand
pub const BPF_JSET: u16 = 0x40; // jump if A & operand != 0

// Operand source
pub const BPF_K: u16 = 0x00; // constant operand
pub const BPF_X: u16 = 0x08; // index register operand

// RET value source
pub const BPF_A: u16 = 0x10;

// MISC operations
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

#[inline]
const fn class(code: u16) -> u16 {
    code & 0x07
}

#[inline]
const fn size(code: u16) -> u16 {
    code & 0x18
}

#[inline]
const fn mode(code: u16) -> u16 {
    code & 0xe0
}

#[inline]
const fn op(code: u16) -> u16 {
    code & 0xf0
}

#[inline]
const fn src(code: u16) -> u16 {
    code & 0x08
}

/// Construct a single instruction with the given fields.
pub const fn insn(code: u16, jt: u8, jf: u8, k: u32) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Check a program the way the kernel does before accepting it on a socket.
///
/// Returns a description of the first problem found.
pub fn validate(program: &[SockFilter]) -> Result<(), String> {
    if program.is_empty() {
        return Err("program is empty".to_string());
    }
    if program.len() > MAX_INSNS {
        return Err(format!(
            "program has {} instructions, limit is {MAX_INSNS}",
            program.len()
        ));
    }

    let len = program.len();
    for (pc, inst) in program.iter().enumerate() {
        let code = inst.code;
        match class(code) {
            BPF_LD | BPF_LDX => {
                let m = mode(code);
                match m {
                    BPF_IMM | BPF_ABS | BPF_IND | BPF_LEN => {}
                    BPF_MEM => {
                        if inst.k as usize >= MEM_WORDS {
                            return Err(format!("[{pc}] scratch slot {} out of range", inst.k));
                        }
                    }
                    BPF_MSH if class(code) == BPF_LDX => {}
                    _ => return Err(format!("[{pc}] unknown load mode 0x{m:x}")),
                }
                if class(code) == BPF_LD && matches!(m, BPF_ABS | BPF_IND) && size(code) == 0x18 {
                    return Err(format!("[{pc}] unknown load size"));
                }
            }
            BPF_ST | BPF_STX => {
                if inst.k as usize >= MEM_WORDS {
                    return Err(format!("[{pc}] scratch slot {} out of range", inst.k));
                }
            }
            BPF_ALU => match op(code) {
                BPF_ADD | BPF_SUB | BPF_MUL | BPF_OR | BPF_AND | BPF_LSH | BPF_RSH | BPF_NEG
                | BPF_XOR => {}
                BPF_DIV | BPF_MOD => {
                    if src(code) == BPF_K && inst.k == 0 {
                        return Err(format!("[{pc}] division by constant zero"));
                    }
                }
                o => return Err(format!("[{pc}] unknown ALU operation 0x{o:x}")),
            },
            BPF_JMP => {
                let next = pc + 1;
                match op(code) {
                    BPF_JA => {
                        let target = next as u64 + inst.k as u64;
                        if target >= len as u64 {
                            return Err(format!("[{pc}] jump target {target} out of range"));
                        }
                    }
                    BPF_JEQ | BPF_JGT | BPF_JGE | BPF_JSET => {
                        for off in [inst.jt, inst.jf] {
                            if next + off as usize >= len {
                                return Err(format!(
                                    "[{pc}] branch target {} out of range",
                                    next + off as usize
                                ));
                            }
                        }
                    }
                    o => return Err(format!("[{pc}] unknown jump operation 0x{o:x}")),
                }
            }
            BPF_RET => {}
            BPF_MISC => match code & 0xf8 {
                BPF_TAX | BPF_TXA => {}
                o => return Err(format!("[{pc}] unknown misc operation 0x{o:x}")),
            },
            _ => unreachable!("class is three bits"),
        }
    }

    let last = program[len - 1];
    if class(last.code) != BPF_RET {
        return Err("last instruction is not a return".to_string());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

fn load(packet: &[u8], off: u32, sz: u16) -> Option<u32> {
    let off = off as usize;
    match sz {
        BPF_W => {
            let b = packet.get(off..off.checked_add(4)?)?;
            Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
        BPF_H => {
            let b = packet.get(off..off.checked_add(2)?)?;
            Some(u16::from_be_bytes([b[0], b[1]]) as u32)
        }
        BPF_B => packet.get(off).map(|b| *b as u32),
        _ => None,
    }
}

/// Execute a classic BPF program against a frame.
///
/// Returns the value of the `RET` instruction reached: 0 rejects the frame,
/// anything else is the number of bytes to keep. Out-of-bounds packet loads,
/// division by zero and running off the end all reject, as in the kernel.
pub fn run(program: &[SockFilter], packet: &[u8]) -> u32 {
    let mut a: u32 = 0; // accumulator
    let mut x: u32 = 0; // index register
    let mut mem = [0u32; MEM_WORDS];
    let mut pc: usize = 0;
    let wire_len = packet.len() as u32;

    while pc < program.len() {
        let inst = program[pc];
        let code = inst.code;

        match class(code) {
            BPF_LD => {
                a = match mode(code) {
                    BPF_ABS => match load(packet, inst.k, size(code)) {
                        Some(v) => v,
                        None => return 0,
                    },
                    BPF_IND => {
                        let Some(off) = x.checked_add(inst.k) else {
                            return 0;
                        };
                        match load(packet, off, size(code)) {
                            Some(v) => v,
                            None => return 0,
                        }
                    }
                    BPF_MEM => mem[inst.k as usize & (MEM_WORDS - 1)],
                    BPF_IMM => inst.k,
                    BPF_LEN => wire_len,
                    _ => return 0,
                };
            }
            BPF_LDX => {
                x = match mode(code) {
                    BPF_IMM => inst.k,
                    BPF_MEM => mem[inst.k as usize & (MEM_WORDS - 1)],
                    BPF_LEN => wire_len,
                    BPF_MSH => match packet.get(inst.k as usize) {
                        Some(b) => ((b & 0x0f) as u32) * 4,
                        None => return 0,
                    },
                    _ => return 0,
                };
            }
            BPF_ST => mem[inst.k as usize & (MEM_WORDS - 1)] = a,
            BPF_STX => mem[inst.k as usize & (MEM_WORDS - 1)] = x,
            BPF_ALU => {
                let operand = if src(code) == BPF_X { x } else { inst.k };
                a = match op(code) {
                    BPF_ADD => a.wrapping_add(operand),
                    BPF_SUB => a.wrapping_sub(operand),
                    BPF_MUL => a.wrapping_mul(operand),
                    BPF_DIV => match a.checked_div(operand) {
                        Some(v) => v,
                        None => return 0,
                    },
                    BPF_MOD => match a.checked_rem(operand) {
                        Some(v) => v,
                        None => return 0,
                    },
                    BPF_OR => a | operand,
                    BPF_AND => a & operand,
                    BPF_XOR => a ^ operand,
                    BPF_LSH => a.checked_shl(operand).unwrap_or(0),
                    BPF_RSH => a.checked_shr(operand).unwrap_or(0),
                    BPF_NEG => (a as i32).wrapping_neg() as u32,
                    _ => return 0,
                };
            }
            BPF_JMP => {
                let operand = if src(code) == BPF_X { x } else { inst.k };
                let taken = match op(code) {
                    BPF_JA => {
                        pc = pc.saturating_add(1).saturating_add(inst.k as usize);
                        continue;
                    }
                    BPF_JEQ => a == operand,
                    BPF_JGT => a > operand,
                    BPF_JGE => a >= operand,
                    BPF_JSET => a & operand != 0,
                    _ => return 0,
                };
                pc += 1 + if taken { inst.jt as usize } else { inst.jf as usize };
                continue;
            }
            BPF_RET => {
                return if code & 0x18 == BPF_A { a } else { inst.k };
            }
            BPF_MISC => match code & 0xf8 {
                BPF_TAX => x = a,
                BPF_TXA => a = x,
                _ => return 0,
            },
            _ => return 0,
        }
        pc += 1;
    }
    // Fell off the end without a RET.
    0
}

// ===========================================================================
// Tests
// ===========================================================================
