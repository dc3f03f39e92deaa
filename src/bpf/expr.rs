// Capture expression parser.
//
// Accepts the commonly used subset of the tcpdump/pcap-filter grammar and
// produces an `Expr` tree whose leaves are fully qualified primitives.
// Qualifiers omitted from a bare id are inherited from the previous
// primitive, so `port 80 or 443` reads as `port 80 or port 443`.

use std::net::{IpAddr, Ipv4Addr};

use super::{FilterError, MAX_NESTING};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Protocol qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Ether,
    Ip,
    Ip6,
    Arp,
    Rarp,
    Tcp,
    Udp,
    Sctp,
    Icmp,
    Icmp6,
}

impl Proto {
    fn from_word(w: &str) -> Option<Self> {
        Some(match w {
            "ether" | "link" => Proto::Ether,
            "ip" => Proto::Ip,
            "ip6" => Proto::Ip6,
            "arp" => Proto::Arp,
            "rarp" => Proto::Rarp,
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            "sctp" => Proto::Sctp,
            "icmp" => Proto::Icmp,
            "icmp6" => Proto::Icmp6,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Proto::Ether => "ether",
            Proto::Ip => "ip",
            Proto::Ip6 => "ip6",
            Proto::Arp => "arp",
            Proto::Rarp => "rarp",
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Sctp => "sctp",
            Proto::Icmp => "icmp",
            Proto::Icmp6 => "icmp6",
        }
    }
}

/// Direction qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dir {
    Src,
    Dst,
    #[default]
    SrcOrDst,
    SrcAndDst,
}

/// Address type qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Host,
    Net,
    Port,
    PortRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Quals {
    proto: Option<Proto>,
    dir: Dir,
    kind: Kind,
}

/// A single, fully qualified match condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    /// A bare protocol keyword such as `udp` or `arp`.
    Proto(Proto),
    Host {
        proto: Option<Proto>,
        dir: Dir,
        addr: IpAddr,
    },
    EtherHost {
        dir: Dir,
        mac: [u8; 6],
    },
    Net {
        proto: Option<Proto>,
        dir: Dir,
        addr: Ipv4Addr,
        mask: u32,
    },
    Port {
        proto: Option<Proto>,
        dir: Dir,
        low: u16,
        high: u16,
    },
    EtherProto(u16),
    /// `ip proto`, `ip6 proto`, or `proto` (either family) when `family` is `None`.
    IpProto {
        family: Option<Proto>,
        proto: u8,
    },
    EtherBroadcast,
    EtherMulticast,
    /// Frame length at most this many bytes.
    Less(u32),
    /// Frame length at least this many bytes.
    Greater(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Primitive(Primitive),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok<'a> {
    Word(&'a str),
    LParen,
    RParen,
    Not,
    And,
    Or,
}

#[derive(Debug, Clone)]
struct Token<'a> {
    tok: Tok<'a>,
    offset: usize,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b':' | b'/' | b'-' | b'_' | b'\\')
}

fn tokenize(input: &str) -> Result<Vec<Token<'_>>, FilterError> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let start = i;
        let tok = match b {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                Tok::LParen
            }
            b')' => {
                i += 1;
                Tok::RParen
            }
            b'!' => {
                i += 1;
                Tok::Not
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                i += 2;
                Tok::And
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                i += 2;
                Tok::Or
            }
            _ if is_word_byte(b) => {
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                match &input[start..i] {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    w => Tok::Word(w),
                }
            }
            _ => {
                let ch = input[start..].chars().next().unwrap_or('?');
                return Err(FilterError::new(start, format!("unexpected character '{ch}'")));
            }
        };
        out.push(Token { tok, offset: start });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a capture expression into an AST.
pub fn parse(input: &str) -> Result<Expr, FilterError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(FilterError::new(0, "empty capture expression"));
    }
    let mut p = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        last: None,
        nesting: 0,
    };
    let (expr, _) = p.or_expr()?;
    if let Some(t) = p.peek() {
        return Err(FilterError::new(
            t.offset,
            format!("unexpected '{}' after complete expression", describe(&t.tok)),
        ));
    }
    Ok(expr)
}

fn describe(tok: &Tok<'_>) -> String {
    match tok {
        Tok::Word(w) => (*w).to_string(),
        Tok::LParen => "(".to_string(),
        Tok::RParen => ")".to_string(),
        Tok::Not => "not".to_string(),
        Tok::And => "and".to_string(),
        Tok::Or => "or".to_string(),
    }
}

const KEYWORDS: &[&str] = &[
    "ether", "link", "ip", "ip6", "arp", "rarp", "tcp", "udp", "sctp", "icmp", "icmp6", "src",
    "dst", "host", "net", "port", "portrange", "proto", "mask", "less", "greater", "broadcast",
    "multicast", "gateway", "vlan", "mpls",
];

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    end: usize,
    /// Qualifiers of the previous id-carrying primitive.
    last: Option<Quals>,
    /// Open `not`s and parentheses above the current position.
    nesting: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn peek_word(&self) -> Option<&'a str> {
        match self.tokens.get(self.pos) {
            Some(Token { tok: Tok::Word(w), .. }) => Some(w),
            _ => None,
        }
    }

    fn peek_word_at(&self, ahead: usize) -> Option<&'a str> {
        match self.tokens.get(self.pos + ahead) {
            Some(Token { tok: Tok::Word(w), .. }) => Some(w),
            _ => None,
        }
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(self.end)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.peek_word() == Some(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_value(&mut self, what: &str) -> Result<(&'a str, usize), FilterError> {
        match self.tokens.get(self.pos) {
            Some(Token { tok: Tok::Word(w), offset }) => {
                let (w, offset) = (*w, *offset);
                self.pos += 1;
                Ok((w, offset))
            }
            Some(t) => Err(FilterError::new(
                t.offset,
                format!("expected {what}, found '{}'", describe(&t.tok)),
            )),
            None => Err(FilterError::new(self.end, format!("expected {what} at end of expression"))),
        }
    }

    /// Fails once an expression would be more than [`MAX_NESTING`] levels deep.
    fn check_depth(&self, height: usize, offset: usize) -> Result<usize, FilterError> {
        if height > MAX_NESTING {
            return Err(FilterError::new(
                offset,
                format!("expression nested more than {MAX_NESTING} levels deep"),
            ));
        }
        Ok(height)
    }

    fn or_expr(&mut self) -> Result<(Expr, usize), FilterError> {
        let (mut lhs, mut height) = self.and_expr()?;
        while let Some(Token { tok: Tok::Or, offset }) = self.peek() {
            let offset = *offset;
            self.pos += 1;
            let (rhs, h) = self.and_expr()?;
            height = self.check_depth(height.max(h) + 1, offset)?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, height))
    }

    fn and_expr(&mut self) -> Result<(Expr, usize), FilterError> {
        let (mut lhs, mut height) = self.unary()?;
        while let Some(Token { tok: Tok::And, offset }) = self.peek() {
            let offset = *offset;
            self.pos += 1;
            let (rhs, h) = self.unary()?;
            height = self.check_depth(height.max(h) + 1, offset)?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, height))
    }

    fn unary(&mut self) -> Result<(Expr, usize), FilterError> {
        match self.peek().map(|t| (t.tok.clone(), t.offset)) {
            Some((Tok::Not, offset)) => {
                self.enter(offset)?;
                self.pos += 1;
                let (inner, h) = self.unary()?;
                self.nesting -= 1;
                let height = self.check_depth(h + 1, offset)?;
                Ok((Expr::Not(Box::new(inner)), height))
            }
            Some((Tok::LParen, open)) => {
                self.enter(open)?;
                self.pos += 1;
                let inner = self.or_expr()?;
                self.nesting -= 1;
                match self.peek() {
                    Some(Token { tok: Tok::RParen, .. }) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(FilterError::new(open, "unbalanced '('")),
                }
            }
            Some((Tok::Word(_), _)) => Ok((Expr::Primitive(self.primitive()?), 1)),
            Some((tok, offset)) => Err(FilterError::new(
                offset,
                format!("expected a primitive, found '{}'", describe(&tok)),
            )),
            None => Err(FilterError::new(self.end, "expression ends after an operator")),
        }
    }

    /// Bounds recursion through `not` and parentheses before descending.
    fn enter(&mut self, offset: usize) -> Result<(), FilterError> {
        self.nesting += 1;
        self.check_depth(self.nesting, offset).map(|_| ())
    }

    fn primitive(&mut self) -> Result<Primitive, FilterError> {
        let start = self.offset();

        if self.eat_word("less") {
            return Ok(Primitive::Less(self.number("length")?));
        }
        if self.eat_word("greater") {
            return Ok(Primitive::Greater(self.number("length")?));
        }
        if self.eat_word("proto") {
            let proto = self.ip_proto_number()?;
            return Ok(Primitive::IpProto { family: None, proto });
        }

        let proto = match self.peek_word().and_then(Proto::from_word) {
            Some(p) => {
                self.pos += 1;
                Some(p)
            }
            None => None,
        };

        match proto {
            Some(Proto::Ether) => {
                if self.eat_word("proto") {
                    return Ok(Primitive::EtherProto(self.ether_type()?));
                }
                if self.eat_word("broadcast") {
                    return Ok(Primitive::EtherBroadcast);
                }
                if self.eat_word("multicast") {
                    return Ok(Primitive::EtherMulticast);
                }
            }
            Some(family @ (Proto::Ip | Proto::Ip6)) => {
                if self.eat_word("proto") {
                    let proto = self.ip_proto_number()?;
                    return Ok(Primitive::IpProto { family: Some(family), proto });
                }
            }
            _ => {}
        }

        let dir = self.direction();
        let kind = match self.peek_word() {
            Some("host") => Some(Kind::Host),
            Some("net") => Some(Kind::Net),
            Some("port") => Some(Kind::Port),
            Some("portrange") => Some(Kind::PortRange),
            _ => None,
        };
        if kind.is_some() {
            self.pos += 1;
        }

        let quals = match (proto, dir, kind) {
            (Some(p), None, None) => {
                if p == Proto::Ether {
                    return Err(FilterError::new(
                        start,
                        "'ether' needs a qualifier (host, src, dst, proto, broadcast, multicast)",
                    ));
                }
                return Ok(Primitive::Proto(p));
            }
            (None, None, None) => match self.last {
                Some(q) => q,
                None => Quals {
                    proto: None,
                    dir: Dir::SrcOrDst,
                    kind: Kind::Host,
                },
            },
            (proto, dir, kind) => Quals {
                proto,
                dir: dir.unwrap_or_default(),
                kind: kind.unwrap_or(Kind::Host),
            },
        };

        let prim = self.qualified_value(quals)?;
        self.last = Some(quals);
        Ok(prim)
    }

    /// `src`, `dst`, `src or dst`, `src and dst`.
    fn direction(&mut self) -> Option<Dir> {
        let first = match self.peek_word() {
            Some("src") => Dir::Src,
            Some("dst") => Dir::Dst,
            _ => return None,
        };
        self.pos += 1;

        let combined = match self.tokens.get(self.pos).map(|t| &t.tok) {
            Some(Tok::Or) => Some(Dir::SrcOrDst),
            Some(Tok::And) => Some(Dir::SrcAndDst),
            _ => None,
        };
        if let Some(d) = combined {
            let other = if first == Dir::Src { "dst" } else { "src" };
            if self.peek_word_at(1) == Some(other) {
                self.pos += 2;
                return Some(d);
            }
        }
        Some(first)
    }

    fn qualified_value(&mut self, q: Quals) -> Result<Primitive, FilterError> {
        match q.kind {
            Kind::Host => {
                let (word, offset) = self.expect_value("a host address")?;
                self.host(q, word, offset)
            }
            Kind::Net => {
                let (word, offset) = self.expect_value("a network")?;
                self.net(q, word, offset)
            }
            Kind::Port => {
                let (word, offset) = self.expect_value("a port")?;
                self.check_port_proto(q.proto, offset)?;
                let port = parse_port(word).ok_or_else(|| {
                    FilterError::new(offset, format!("invalid port '{word}'"))
                })?;
                Ok(Primitive::Port {
                    proto: q.proto,
                    dir: q.dir,
                    low: port,
                    high: port,
                })
            }
            Kind::PortRange => {
                let (word, offset) = self.expect_value("a port range")?;
                self.check_port_proto(q.proto, offset)?;
                let (lo, hi) = word
                    .split_once('-')
                    .and_then(|(a, b)| Some((parse_port(a)?, parse_port(b)?)))
                    .ok_or_else(|| {
                        FilterError::new(offset, format!("invalid port range '{word}'"))
                    })?;
                let (low, high) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                Ok(Primitive::Port {
                    proto: q.proto,
                    dir: q.dir,
                    low,
                    high,
                })
            }
        }
    }

    fn host(&mut self, q: Quals, word: &str, offset: usize) -> Result<Primitive, FilterError> {
        if q.proto == Some(Proto::Ether) {
            let mac = parse_mac(word).ok_or_else(|| {
                FilterError::new(offset, format!("invalid ethernet address '{word}'"))
            })?;
            return Ok(Primitive::EtherHost { dir: q.dir, mac });
        }
        if let Some(p @ (Proto::Tcp | Proto::Udp | Proto::Sctp | Proto::Icmp | Proto::Icmp6)) = q.proto
        {
            return Err(FilterError::new(
                offset,
                format!("'{}' modifier applied to host", p.name()),
            ));
        }
        if KEYWORDS.contains(&word) {
            return Err(FilterError::new(
                offset,
                format!("expected a host address, found keyword '{word}'"),
            ));
        }
        let addr: IpAddr = match word.parse() {
            Ok(a) => a,
            Err(_) if parse_mac(word).is_some() => {
                return Err(FilterError::new(
                    offset,
                    "ethernet address used in non-ether expression",
                ));
            }
            Err(_) => {
                return Err(FilterError::new(
                    offset,
                    format!("unknown host '{word}' (names are not resolved)"),
                ));
            }
        };
        match (q.proto, addr) {
            (Some(Proto::Ip6), IpAddr::V4(_)) => Err(FilterError::new(
                offset,
                "IPv4 address used with 'ip6' qualifier",
            )),
            (Some(p @ (Proto::Ip | Proto::Arp | Proto::Rarp)), IpAddr::V6(_)) => Err(
                FilterError::new(offset, format!("IPv6 address used with '{}' qualifier", p.name())),
            ),
            _ => Ok(Primitive::Host {
                proto: q.proto,
                dir: q.dir,
                addr,
            }),
        }
    }

    fn net(&mut self, q: Quals, word: &str, offset: usize) -> Result<Primitive, FilterError> {
        match q.proto {
            None | Some(Proto::Ip | Proto::Arp | Proto::Rarp) => {}
            Some(p) => {
                return Err(FilterError::new(
                    offset,
                    format!("'{}' modifier applied to net", p.name()),
                ));
            }
        }

        let (addr, mask) = if let Some((a, len)) = word.split_once('/') {
            let (addr, _) = parse_partial_ipv4(a)
                .ok_or_else(|| FilterError::new(offset, format!("invalid network '{word}'")))?;
            let len: u32 = len
                .parse()
                .ok()
                .filter(|l| *l <= 32)
                .ok_or_else(|| FilterError::new(offset, format!("invalid mask length in '{word}'")))?;
            (addr, prefix_mask(len))
        } else if self.eat_word("mask") {
            let (addr, _) = parse_partial_ipv4(word)
                .ok_or_else(|| FilterError::new(offset, format!("invalid network '{word}'")))?;
            let (m, moff) = self.expect_value("a netmask")?;
            let mask: Ipv4Addr = m
                .parse()
                .map_err(|_| FilterError::new(moff, format!("invalid netmask '{m}'")))?;
            (addr, u32::from(mask))
        } else {
            let (addr, octets) = parse_partial_ipv4(word)
                .ok_or_else(|| FilterError::new(offset, format!("invalid network '{word}'")))?;
            (addr, prefix_mask(octets * 8))
        };

        if u32::from(addr) & !mask != 0 {
            return Err(FilterError::new(
                offset,
                format!("non-network bits set in \"{word}\""),
            ));
        }
        Ok(Primitive::Net {
            proto: q.proto,
            dir: q.dir,
            addr,
            mask,
        })
    }

    fn check_port_proto(&self, proto: Option<Proto>, offset: usize) -> Result<(), FilterError> {
        match proto {
            None | Some(Proto::Tcp | Proto::Udp | Proto::Sctp | Proto::Ip | Proto::Ip6) => Ok(()),
            Some(p) => Err(FilterError::new(
                offset,
                format!("'{}' modifier applied to port", p.name()),
            )),
        }
    }

    fn number(&mut self, what: &str) -> Result<u32, FilterError> {
        let (word, offset) = self.expect_value(what)?;
        parse_number(word).ok_or_else(|| FilterError::new(offset, format!("invalid {what} '{word}'")))
    }

    fn ether_type(&mut self) -> Result<u16, FilterError> {
        let (word, offset) = self.expect_value("an ethernet type")?;
        let name = word.trim_start_matches('\\');
        let v = match name {
            "ip" => 0x0800,
            "ip6" => 0x86dd,
            "arp" => 0x0806,
            "rarp" => 0x8035,
            _ => parse_number(name)
                .filter(|v| *v <= 0xffff)
                .ok_or_else(|| FilterError::new(offset, format!("invalid ethernet type '{word}'")))?,
        };
        Ok(v as u16)
    }

    fn ip_proto_number(&mut self) -> Result<u8, FilterError> {
        let (word, offset) = self.expect_value("a protocol")?;
        let name = word.trim_start_matches('\\');
        let v = match name {
            "icmp" => 1,
            "igmp" => 2,
            "tcp" => 6,
            "udp" => 17,
            "icmp6" => 58,
            "sctp" => 132,
            _ => parse_number(name)
                .filter(|v| *v <= 0xff)
                .ok_or_else(|| FilterError::new(offset, format!("invalid protocol '{word}'")))?,
        };
        Ok(v as u8)
    }
}

// ---------------------------------------------------------------------------
// Value parsing helpers
// ---------------------------------------------------------------------------

fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_port(s: &str) -> Option<u16> {
    let well_known = match s {
        "ftp-data" => Some(20),
        "ftp" => Some(21),
        "ssh" => Some(22),
        "telnet" => Some(23),
        "smtp" => Some(25),
        "domain" => Some(53),
        "bootps" => Some(67),
        "bootpc" => Some(68),
        "tftp" => Some(69),
        "http" => Some(80),
        "ntp" => Some(123),
        "snmp" => Some(161),
        "https" => Some(443),
        _ => None,
    };
    well_known.or_else(|| parse_number(s).and_then(|n| u16::try_from(n).ok()))
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split([':', '-', '.']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(&parts) {
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

/// Parse `a`, `a.b`, `a.b.c` or `a.b.c.d`; returns the address and the
/// number of octets given.
fn parse_partial_ipv4(s: &str) -> Option<(Ipv4Addr, u32)> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse().ok()?;
    }
    Some((Ipv4Addr::from(octets), parts.len() as u32))
}

fn prefix_mask(len: u32) -> u32 {
    match len {
        0 => 0,
        l if l >= 32 => u32::MAX,
        l => u32::MAX << (32 - l),
    }
}
