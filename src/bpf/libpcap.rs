// Compilation through the system libpcap.
//
// Uses a dead Ethernet handle, the same way tcpdump -d compiles without a
// live interface, with the optimizer enabled and a zero netmask. Callers
// must hold the compile lock.

use pcap::{Capture, Linktype};

use super::FilterError;
use super::filter::{BPF_K, BPF_RET, SockFilter, insn};

pub(super) fn compile(expression: &str, snaplen: u32) -> Result<Vec<SockFilter>, FilterError> {
    let dead = Capture::dead(Linktype::ETHERNET)
        .map_err(|e| FilterError::new(0, format!("pcap_open_dead failed: {e}")))?;
    let program = dead
        .compile(expression, true)
        .map_err(|e| FilterError::new(0, e.to_string()))?;

    program
        .get_instructions()
        .iter()
        .map(|i| parse_instruction(&i.to_string()).map(|ins| clamp_accept(ins, snaplen)))
        .collect()
}

/// `BpfInstruction` only exposes its fields through `Display`, which prints
/// `code jt jf k` in decimal.
fn parse_instruction(text: &str) -> Result<SockFilter, FilterError> {
    let bad = || FilterError::new(0, format!("unrecognized instruction from libpcap: {text:?}"));
    let mut fields = text.split_whitespace();
    let mut next = || fields.next().ok_or_else(bad);
    let code = next()?.parse::<u16>().map_err(|_| bad())?;
    let jt = next()?.parse::<u8>().map_err(|_| bad())?;
    let jf = next()?.parse::<u8>().map_err(|_| bad())?;
    let k = next()?.parse::<u32>().map_err(|_| bad())?;
    Ok(insn(code, jt, jf, k))
}

/// The dead handle's snaplen is fixed at 65535; bring accept lengths down
/// to the configured one.
fn clamp_accept(ins: SockFilter, snaplen: u32) -> SockFilter {
    if ins.code == BPF_RET | BPF_K && ins.k > snaplen {
        insn(ins.code, ins.jt, ins.jf, snaplen)
    } else {
        ins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_display_form() {
        assert_eq!(parse_instruction("40 0 0 12").unwrap(), insn(0x28, 0, 0, 12));
        assert!(parse_instruction("40 0 0").is_err());
        assert!(parse_instruction("x 0 0 1").is_err());
    }

    #[test]
    fn accept_length_is_clamped() {
        let ret = insn(BPF_RET | BPF_K, 0, 0, 262144);
        assert_eq!(clamp_accept(ret, 9000).k, 9000);
        let drop = insn(BPF_RET | BPF_K, 0, 0, 0);
        assert_eq!(clamp_accept(drop, 9000).k, 0);
    }

    #[test]
    fn compiles_through_libpcap() {
        let _guard = super::super::COMPILE_LOCK.lock();
        let prog = compile("dst port 4991", 9000).unwrap();
        assert!(!prog.is_empty());
        assert!(compile("dst port", 9000).is_err());
    }
}
