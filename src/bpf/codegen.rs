// Lowering of parsed capture expressions to classic BPF.
//
// Every primitive is first turned into a small predicate tree over header
// field tests (`Pred`). The tree is then emitted with symbolic true/false
// labels; labels resolve to forward jump offsets once the program is laid
// out. The emitter remembers what the accumulator and index register hold
// along each path, so a chain of tests on the same field loads it once.

use std::net::{IpAddr, Ipv6Addr};

use super::FilterError;
use super::expr::{Dir, Expr, Primitive, Proto};
use super::filter::*;

const ETHERTYPE_IP: u32 = 0x0800;
const ETHERTYPE_IPV6: u32 = 0x86dd;
const ETHERTYPE_ARP: u32 = 0x0806;
const ETHERTYPE_RARP: u32 = 0x8035;

const IPPROTO_ICMP: u32 = 1;
const IPPROTO_TCP: u32 = 6;
const IPPROTO_UDP: u32 = 17;
const IPPROTO_IPV6_FRAG: u32 = 44;
const IPPROTO_ICMPV6: u32 = 58;
const IPPROTO_SCTP: u32 = 132;

const ETH_HLEN: u32 = 14;

/// Packet field an accumulator load reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Load {
    /// Fixed offset from the start of the frame; size is `BPF_W/H/B`.
    Abs { size: u16, off: u32 },
    /// Offset from the start of the IPv4 payload (needs `X = 4 * ihl`).
    Ip4Payload { size: u16, off: u32 },
    /// Frame length.
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Gt,
    Ge,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Test {
    load: Load,
    mask: Option<u32>,
    cmp: Cmp,
    k: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pred {
    True,
    False,
    Test(Test),
    And(Vec<Pred>),
    Or(Vec<Pred>),
    Not(Box<Pred>),
}

fn test(load: Load, cmp: Cmp, k: u32) -> Pred {
    Pred::Test(Test { load, mask: None, cmp, k })
}

fn abs(size: u16, off: u32) -> Load {
    Load::Abs { size, off }
}

fn not(p: Pred) -> Pred {
    Pred::Not(Box::new(p))
}

// ---------------------------------------------------------------------------
// Expression -> predicate lowering
// ---------------------------------------------------------------------------

fn lower(expr: &Expr) -> Result<Pred, FilterError> {
    Ok(match expr {
        Expr::And(a, b) => Pred::And(vec![lower(a)?, lower(b)?]),
        Expr::Or(a, b) => Pred::Or(vec![lower(a)?, lower(b)?]),
        Expr::Not(a) => not(lower(a)?),
        Expr::Primitive(p) => lower_primitive(p)?,
    })
}

fn ethertype(t: u32) -> Pred {
    test(abs(BPF_H, 12), Cmp::Eq, t)
}

fn ip4_proto(p: u32) -> Pred {
    Pred::And(vec![ethertype(ETHERTYPE_IP), test(abs(BPF_B, ETH_HLEN + 9), Cmp::Eq, p)])
}

/// IPv6 next header, also looking through a single fragment header.
fn ip6_next_header(p: u32) -> Pred {
    Pred::Or(vec![
        test(abs(BPF_B, ETH_HLEN + 6), Cmp::Eq, p),
        Pred::And(vec![
            test(abs(BPF_B, ETH_HLEN + 6), Cmp::Eq, IPPROTO_IPV6_FRAG),
            test(abs(BPF_B, ETH_HLEN + 40), Cmp::Eq, p),
        ]),
    ])
}

fn ip6_proto(p: u32) -> Pred {
    Pred::And(vec![ethertype(ETHERTYPE_IPV6), ip6_next_header(p)])
}

fn either_family(p: u32) -> Pred {
    Pred::Or(vec![ip4_proto(p), ip6_proto(p)])
}

fn by_dir(dir: Dir, src: Pred, dst: Pred) -> Pred {
    match dir {
        Dir::Src => src,
        Dir::Dst => dst,
        Dir::SrcOrDst => Pred::Or(vec![src, dst]),
        Dir::SrcAndDst => Pred::And(vec![src, dst]),
    }
}

fn lower_primitive(p: &Primitive) -> Result<Pred, FilterError> {
    Ok(match *p {
        Primitive::Proto(proto) => match proto {
            Proto::Ip => ethertype(ETHERTYPE_IP),
            Proto::Ip6 => ethertype(ETHERTYPE_IPV6),
            Proto::Arp => ethertype(ETHERTYPE_ARP),
            Proto::Rarp => ethertype(ETHERTYPE_RARP),
            Proto::Tcp => either_family(IPPROTO_TCP),
            Proto::Udp => either_family(IPPROTO_UDP),
            Proto::Sctp => either_family(IPPROTO_SCTP),
            Proto::Icmp => ip4_proto(IPPROTO_ICMP),
            Proto::Icmp6 => ip6_proto(IPPROTO_ICMPV6),
            // The parser never produces a bare `ether`.
            Proto::Ether => Pred::True,
        },
        Primitive::Host { proto, dir, addr } => match addr {
            IpAddr::V4(a) => ipv4_match(proto, dir, u32::from(a), u32::MAX),
            IpAddr::V6(a) => Pred::And(vec![ethertype(ETHERTYPE_IPV6), ipv6_host(dir, a)]),
        },
        Primitive::Net { proto, dir, addr, mask } => ipv4_match(proto, dir, u32::from(addr), mask),
        Primitive::EtherHost { dir, mac } => by_dir(dir, mac_eq(6, &mac), mac_eq(0, &mac)),
        Primitive::EtherBroadcast => mac_eq(0, &[0xff; 6]),
        Primitive::EtherMulticast => test(abs(BPF_B, 0), Cmp::Set, 0x01),
        Primitive::EtherProto(t) => ethertype(t as u32),
        Primitive::IpProto { family, proto } => {
            let proto = proto as u32;
            match family {
                Some(Proto::Ip) => ip4_proto(proto),
                Some(Proto::Ip6) => ip6_proto(proto),
                _ => either_family(proto),
            }
        }
        Primitive::Port { proto, dir, low, high } => port_match(proto, dir, low, high),
        Primitive::Less(n) => not(test(Load::Len, Cmp::Gt, n)),
        Primitive::Greater(n) => test(Load::Len, Cmp::Ge, n),
    })
}

/// IPv4 address (or network) match for IP, ARP and RARP frames.
fn ipv4_match(proto: Option<Proto>, dir: Dir, addr: u32, mask: u32) -> Pred {
    let field = |off: u32| {
        Pred::Test(Test {
            load: abs(BPF_W, off),
            mask: (mask != u32::MAX).then_some(mask),
            cmp: Cmp::Eq,
            k: addr & mask,
        })
    };
    // IPv4 saddr/daddr at 12/16 of the IP header; ARP spa/tpa at 14/24 of
    // the ARP payload.
    let ip = || Pred::And(vec![ethertype(ETHERTYPE_IP), by_dir(dir, field(26), field(30))]);
    let arp = |t| Pred::And(vec![ethertype(t), by_dir(dir, field(28), field(38))]);

    match proto {
        Some(Proto::Ip) => ip(),
        Some(Proto::Arp) => arp(ETHERTYPE_ARP),
        Some(Proto::Rarp) => arp(ETHERTYPE_RARP),
        _ => Pred::Or(vec![ip(), arp(ETHERTYPE_ARP), arp(ETHERTYPE_RARP)]),
    }
}

fn ipv6_host(dir: Dir, addr: Ipv6Addr) -> Pred {
    let words: Vec<u32> = addr
        .octets()
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let at = |base: u32| {
        Pred::And(
            words
                .iter()
                .enumerate()
                .map(|(i, w)| test(abs(BPF_W, base + 4 * i as u32), Cmp::Eq, *w))
                .collect(),
        )
    };
    by_dir(dir, at(ETH_HLEN + 8), at(ETH_HLEN + 24))
}

fn mac_eq(off: u32, mac: &[u8; 6]) -> Pred {
    let head = u16::from_be_bytes([mac[0], mac[1]]) as u32;
    let tail = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
    Pred::And(vec![
        test(abs(BPF_W, off + 2), Cmp::Eq, tail),
        test(abs(BPF_H, off), Cmp::Eq, head),
    ])
}

fn port_range(load: Load, low: u16, high: u16) -> Pred {
    if low == high {
        test(load, Cmp::Eq, low as u32)
    } else {
        Pred::And(vec![
            test(load, Cmp::Ge, low as u32),
            not(test(load, Cmp::Gt, high as u32)),
        ])
    }
}

fn port_match(proto: Option<Proto>, dir: Dir, low: u16, high: u16) -> Pred {
    let l4: Vec<u32> = match proto {
        Some(Proto::Tcp) => vec![IPPROTO_TCP],
        Some(Proto::Udp) => vec![IPPROTO_UDP],
        Some(Proto::Sctp) => vec![IPPROTO_SCTP],
        _ => vec![IPPROTO_TCP, IPPROTO_UDP, IPPROTO_SCTP],
    };
    let one_of = |field: Load| {
        let alts: Vec<Pred> = l4.iter().map(|p| test(field, Cmp::Eq, *p)).collect();
        if alts.len() == 1 {
            alts.into_iter().next().unwrap_or(Pred::False)
        } else {
            Pred::Or(alts)
        }
    };

    let v4 = || {
        let sport = Load::Ip4Payload { size: BPF_H, off: 0 };
        let dport = Load::Ip4Payload { size: BPF_H, off: 2 };
        Pred::And(vec![
            ethertype(ETHERTYPE_IP),
            one_of(abs(BPF_B, ETH_HLEN + 9)),
            // Only the first fragment carries the transport header.
            not(test(abs(BPF_H, ETH_HLEN + 6), Cmp::Set, 0x1fff)),
            by_dir(dir, port_range(sport, low, high), port_range(dport, low, high)),
        ])
    };
    let v6 = || {
        let sport = abs(BPF_H, ETH_HLEN + 40);
        let dport = abs(BPF_H, ETH_HLEN + 42);
        Pred::And(vec![
            ethertype(ETHERTYPE_IPV6),
            one_of(abs(BPF_B, ETH_HLEN + 6)),
            by_dir(dir, port_range(sport, low, high), port_range(dport, low, high)),
        ])
    };

    match proto {
        Some(Proto::Ip) => v4(),
        Some(Proto::Ip6) => v6(),
        _ => Pred::Or(vec![v4(), v6()]),
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

type Label = usize;

#[derive(Debug, Clone, Copy)]
enum Target {
    Label(Label),
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Insn(SockFilter),
    /// Conditional jump whose targets are labels.
    Jump { code: u16, k: u32, jt: Target, jf: Target },
    /// Unconditional jump to a label.
    Goto(Target),
}

/// What the accumulator and index register are known to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Regs {
    a: Option<(Load, Option<u32>)>,
    x_is_ip_hlen: bool,
}

impl Regs {
    fn merge(self, other: Regs) -> Regs {
        Regs {
            a: if self.a == other.a { self.a } else { None },
            x_is_ip_hlen: self.x_is_ip_hlen && other.x_is_ip_hlen,
        }
    }
}

#[derive(Default)]
struct Emitter {
    ops: Vec<Op>,
    /// Bound position of each label.
    positions: Vec<Option<usize>>,
    /// Register state merged over every jump into each label.
    entry: Vec<Option<Regs>>,
    regs: Regs,
}

impl Emitter {
    fn label(&mut self) -> Label {
        self.positions.push(None);
        self.entry.push(None);
        self.positions.len() - 1
    }

    fn bind(&mut self, l: Label) {
        self.positions[l] = Some(self.ops.len());
        // Every op before a bound label is a jump, so the label is only
        // reached through jumps.
        self.regs = self.entry[l].unwrap_or_default();
    }

    fn note_jump(&mut self, l: Label) {
        let regs = self.regs;
        self.entry[l] = Some(match self.entry[l] {
            Some(prev) => prev.merge(regs),
            None => regs,
        });
    }

    fn push(&mut self, insn: SockFilter) {
        self.ops.push(Op::Insn(insn));
    }

    fn load(&mut self, load: Load, mask: Option<u32>) {
        if self.regs.a == Some((load, mask)) {
            return;
        }
        match load {
            Load::Abs { size, off } => self.push(insn(BPF_LD | size | BPF_ABS, 0, 0, off)),
            Load::Ip4Payload { size, off } => {
                if !self.regs.x_is_ip_hlen {
                    self.push(insn(BPF_LDX | BPF_B | BPF_MSH, 0, 0, ETH_HLEN));
                    self.regs.x_is_ip_hlen = true;
                }
                self.push(insn(BPF_LD | size | BPF_IND, 0, 0, ETH_HLEN + off));
            }
            Load::Len => self.push(insn(BPF_LD | BPF_W | BPF_LEN, 0, 0, 0)),
        }
        if let Some(m) = mask {
            self.push(insn(BPF_ALU | BPF_AND | BPF_K, 0, 0, m));
        }
        self.regs.a = Some((load, mask));
    }

    fn emit(&mut self, pred: &Pred, on_true: Label, on_false: Label) {
        match pred {
            Pred::True => self.goto(on_true),
            Pred::False => self.goto(on_false),
            Pred::Test(t) => {
                self.load(t.load, t.mask);
                let op = match t.cmp {
                    Cmp::Eq => BPF_JEQ,
                    Cmp::Gt => BPF_JGT,
                    Cmp::Ge => BPF_JGE,
                    Cmp::Set => BPF_JSET,
                };
                self.note_jump(on_true);
                self.note_jump(on_false);
                self.ops.push(Op::Jump {
                    code: BPF_JMP | op | BPF_K,
                    k: t.k,
                    jt: Target::Label(on_true),
                    jf: Target::Label(on_false),
                });
            }
            Pred::Not(inner) => self.emit(inner, on_false, on_true),
            Pred::And(parts) => self.emit_chain(parts, on_true, on_false, true),
            Pred::Or(parts) => self.emit_chain(parts, on_true, on_false, false),
        }
    }

    fn emit_chain(&mut self, parts: &[Pred], on_true: Label, on_false: Label, all: bool) {
        let Some((last, init)) = parts.split_last() else {
            // Empty conjunction is true, empty disjunction false.
            self.goto(if all { on_true } else { on_false });
            return;
        };
        for part in init {
            let next = self.label();
            if all {
                self.emit(part, next, on_false);
            } else {
                self.emit(part, on_true, next);
            }
            self.bind(next);
        }
        self.emit(last, on_true, on_false);
    }

    fn goto(&mut self, l: Label) {
        self.note_jump(l);
        self.ops.push(Op::Goto(Target::Label(l)));
    }

    fn resolve(&self, at: usize, target: Target) -> Result<u32, FilterError> {
        let Target::Label(l) = target;
        let pos = self.positions[l].ok_or_else(|| FilterError::new(0, "internal: unbound label"))?;
        Ok((pos - (at + 1)) as u32)
    }

    /// Lay out the program, dropping jumps to the next instruction.
    fn finish(mut self) -> Result<Vec<SockFilter>, FilterError> {
        self.drop_fallthrough_gotos();

        let mut out = Vec::with_capacity(self.ops.len());
        for (at, op) in self.ops.iter().enumerate() {
            out.push(match *op {
                Op::Insn(i) => i,
                Op::Goto(t) => insn(BPF_JMP | BPF_JA, 0, 0, self.resolve(at, t)?),
                Op::Jump { code, k, jt, jf } => {
                    let jt = self.resolve(at, jt)?;
                    let jf = self.resolve(at, jf)?;
                    let (Ok(jt), Ok(jf)) = (u8::try_from(jt), u8::try_from(jf)) else {
                        return Err(FilterError::new(
                            0,
                            "expression too complex: conditional jump exceeds 255 instructions",
                        ));
                    };
                    insn(code, jt, jf, k)
                }
            });
        }
        Ok(out)
    }

    /// Remove `ja` ops whose target is the very next op, shifting label
    /// positions accordingly.
    fn drop_fallthrough_gotos(&mut self) {
        loop {
            let found = self.ops.iter().enumerate().find_map(|(at, op)| match *op {
                Op::Goto(Target::Label(l)) if self.positions[l] == Some(at + 1) => Some(at),
                _ => None,
            });
            let Some(at) = found else { break };
            self.ops.remove(at);
            for pos in self.positions.iter_mut().flatten() {
                if *pos > at {
                    *pos -= 1;
                }
            }
        }
    }
}

/// Lower a parsed expression into a complete program that accepts
/// `snaplen` bytes of matching frames and drops everything else.
pub fn generate(expr: &Expr, snaplen: u32) -> Result<Vec<SockFilter>, FilterError> {
    let pred = lower(expr)?;

    let mut em = Emitter::default();
    let accept = em.label();
    let reject = em.label();
    em.emit(&pred, accept, reject);
    em.bind(accept);
    em.push(insn(BPF_RET | BPF_K, 0, 0, snaplen));
    em.bind(reject);
    em.push(insn(BPF_RET | BPF_K, 0, 0, 0));

    let program = em.finish()?;
    if program.len() > MAX_INSNS {
        return Err(FilterError::new(
            0,
            format!("expression too complex: {} instructions", program.len()),
        ));
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::super::expr::parse;
    use super::*;

    fn compile(expr: &str) -> Vec<SockFilter> {
        generate(&parse(expr).unwrap(), 9000).unwrap()
    }

    #[test]
    fn single_ethertype_test() {
        let prog = compile("arp");
        assert_eq!(
            prog,
            vec![
                insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 12),
                insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, 0x0806),
                insn(BPF_RET | BPF_K, 0, 0, 9000),
                insn(BPF_RET | BPF_K, 0, 0, 0),
            ]
        );
    }

    #[test]
    fn repeated_field_is_loaded_once() {
        // tcp, udp and sctp are all compared against one load of ip[9].
        let prog = compile("port 53");
        let loads = prog
            .iter()
            .filter(|i| i.code == BPF_LD | BPF_B | BPF_ABS && i.k == 23)
            .count();
        assert_eq!(loads, 1, "{prog:?}");
    }

    #[test]
    fn not_swaps_targets() {
        let prog = compile("not arp");
        assert_eq!(prog[1], insn(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 0x0806));
    }

    #[test]
    fn generated_programs_validate() {
        for e in [
            "dst port 4991",
            "tcp portrange 1000-2000",
            "host 10.0.0.1 and not port 22",
            "ip6 src host fe80::1",
            "net 192.168.0.0/16 or ether broadcast",
            "less 128 or greater 1500",
            "(udp and dst port 53) or icmp or icmp6",
            "ether host 00:11:22:33:44:55",
        ] {
            let prog = compile(e);
            validate(&prog).unwrap_or_else(|err| panic!("{e}: {err}"));
            assert_eq!(prog.last().map(|i| i.code), Some(BPF_RET | BPF_K), "{e}");
        }
    }

    #[test]
    fn accept_length_is_snaplen() {
        let prog = generate(&parse("ip").unwrap(), 128).unwrap();
        assert!(prog.iter().any(|i| i.code == BPF_RET | BPF_K && i.k == 128));
    }

    #[test]
    fn oversized_expression_is_rejected() {
        // 200 IPv6 hosts, each well over a handful of instructions.
        let expr = (0..200)
            .map(|i| format!("ip6 host 2001:db8::{i:x}"))
            .collect::<Vec<_>>()
            .join(" and ");
        let err = generate(&parse(&expr).unwrap(), 9000).unwrap_err();
        assert!(err.detail.contains("too complex"), "{err}");
    }
}
