use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use rustc_hash::FxHashMap;

/// Convention for the dual-socket topology: a process receives DATA on its
/// configured port and sends DATA / receives ACKs on configured port + 1000.
pub const SEND_PORT_OFFSET: u16 = 1000;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Host {
    pub id: u32,
    pub addr: SocketAddr,
}

impl Debug for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[#{}@{}]", self.id, self.addr)
    }
}

impl Host {
    /// The address this process sends DATA from and receives ACKs on.
    pub fn send_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.addr.port() + SEND_PORT_OFFSET)
    }
}

/// The membership table for a run: process ids are dense starting at 1, and
/// each id maps to the transport endpoint the process receives DATA on.
#[derive(Debug, Clone)]
pub struct Hosts {
    hosts: Vec<Host>,
    by_recv_addr: FxHashMap<SocketAddr, u32>,
}

impl Hosts {
    pub fn new(mut hosts: Vec<Host>) -> anyhow::Result<Hosts> {
        if hosts.is_empty() {
            bail!("hosts table is empty");
        }
        hosts.sort_by_key(|h| h.id);
        for (idx, host) in hosts.iter().enumerate() {
            if host.id != idx as u32 + 1 {
                bail!("host ids must be dense starting at 1, missing or duplicate id around {}", idx + 1);
            }
        }

        let by_recv_addr = hosts.iter()
            .map(|h| (h.addr, h.id))
            .collect::<FxHashMap<_, _>>();
        if by_recv_addr.len() != hosts.len() {
            bail!("hosts table contains duplicate addresses");
        }

        Ok(Hosts { hosts, by_recv_addr })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Hosts> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading hosts file {:?}", path.as_ref()))?;
        Self::parse(&raw)
    }

    /// One host per line: `<id> <ip> <port>`. Blank lines are ignored.
    pub fn parse(raw: &str) -> anyhow::Result<Hosts> {
        let mut hosts = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let id: u32 = parts.next()
                .ok_or_else(|| anyhow!("missing process id"))?
                .parse()
                .with_context(|| format!("unparseable process id in line {:?}", line))?;
            let ip: IpAddr = parts.next()
                .ok_or_else(|| anyhow!("missing ip for process {}", id))?
                .parse()
                .with_context(|| format!("unparseable ip in line {:?}", line))?;
            let port: u16 = parts.next()
                .ok_or_else(|| anyhow!("missing port for process {}", id))?
                .parse()
                .with_context(|| format!("unparseable port in line {:?}", line))?;
            if parts.next().is_some() {
                bail!("trailing tokens in hosts line {:?}", line);
            }
            if port > u16::MAX - SEND_PORT_OFFSET {
                bail!("port {} of process {} leaves no room for the send port", port, id);
            }

            hosts.push(Host { id, addr: SocketAddr::new(ip, port) });
        }
        Self::new(hosts)
    }

    pub fn num_processes(&self) -> usize {
        self.hosts.len()
    }

    /// Smallest number of processes that is more than half of the membership.
    pub fn majority(&self) -> usize {
        self.hosts.len() / 2 + 1
    }

    pub fn get(&self, id: u32) -> anyhow::Result<&Host> {
        self.hosts.get(id.wrapping_sub(1) as usize)
            .ok_or_else(|| anyhow!("process {} is not in the hosts table", id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    /// Resolves a transport-level source address back to a process id. The
    /// source may be either the process' receive socket or its send socket
    /// (receive port + 1000).
    pub fn process_by_source_addr(&self, src: SocketAddr) -> Option<u32> {
        if let Some(&id) = self.by_recv_addr.get(&src) {
            return Some(id);
        }
        if src.port() > SEND_PORT_OFFSET {
            let recv_addr = SocketAddr::new(src.ip(), src.port() - SEND_PORT_OFFSET);
            return self.by_recv_addr.get(&recv_addr).copied();
        }
        None
    }
}

/// The run mode, distinguished by the shape of the config file's first line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// `<m> <receiver_id>`: one designated receiver, every other process
    /// sends seqs 1..=m to it over a perfect link.
    PerfectLink { message_count: u32, receiver_id: u32 },
    /// `<m>`: every process broadcasts seqs 1..=m.
    FifoBroadcast { message_count: u32 },
    /// `<p> <vs> <ds>` followed by `p` proposal lines. Recognised so the
    /// config parser accepts the full file format, but not runnable here.
    LatticeAgreement {
        proposal_count: u32,
        max_proposal_size: u32,
        distinct_values: u32,
        proposals: Vec<Vec<u32>>,
    },
}

impl RunMode {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<RunMode> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {:?}", path.as_ref()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<RunMode> {
        let mut lines = raw.lines();
        let first_line = lines.next()
            .ok_or_else(|| anyhow!("config file is empty"))?;

        let numbers = first_line.split_whitespace()
            .map(|t| t.parse::<u32>()
                .with_context(|| format!("unparseable number {:?} in config", t)))
            .collect::<anyhow::Result<Vec<u32>>>()?;

        match numbers.as_slice() {
            [m] => {
                Self::check_message_count(*m)?;
                Ok(RunMode::FifoBroadcast { message_count: *m })
            }
            [m, receiver_id] => {
                Self::check_message_count(*m)?;
                Ok(RunMode::PerfectLink {
                    message_count: *m,
                    receiver_id: *receiver_id,
                })
            }
            [p, vs, ds] => {
                let mut proposals = Vec::new();
                for line in lines {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let proposal = line.split_whitespace()
                        .map(|t| t.parse::<u32>()
                            .with_context(|| format!("unparseable proposal value {:?}", t)))
                        .collect::<anyhow::Result<Vec<u32>>>()?;
                    proposals.push(proposal);
                }
                if proposals.len() != *p as usize {
                    bail!("config announces {} proposals but contains {}", p, proposals.len());
                }
                Ok(RunMode::LatticeAgreement {
                    proposal_count: *p,
                    max_proposal_size: *vs,
                    distinct_values: *ds,
                    proposals,
                })
            }
            _ => bail!("config first line must contain one, two or three numbers, found {}", numbers.len()),
        }
    }

    /// Seqs run from 1 to m and must stay within i32 range.
    fn check_message_count(m: u32) -> anyhow::Result<()> {
        if m > i32::MAX as u32 {
            bail!("message count {} exceeds the maximum seq", m);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn three_hosts() -> Hosts {
        Hosts::parse("1 127.0.0.1 11001\n2 127.0.0.1 11002\n3 127.0.0.1 11003\n").unwrap()
    }

    #[test]
    fn test_parse_hosts() {
        let hosts = three_hosts();
        assert_eq!(hosts.num_processes(), 3);
        assert_eq!(hosts.majority(), 2);
        assert_eq!(hosts.get(2).unwrap().addr, "127.0.0.1:11002".parse().unwrap());
        assert_eq!(hosts.get(2).unwrap().send_addr(), "127.0.0.1:12002".parse().unwrap());
        assert!(hosts.get(4).is_err());
    }

    #[test]
    fn test_parse_hosts_unordered_lines() {
        let hosts = Hosts::parse("2 10.0.0.2 9002\n1 10.0.0.1 9001\n").unwrap();
        assert_eq!(hosts.get(1).unwrap().addr, "10.0.0.1:9001".parse().unwrap());
    }

    #[rstest]
    #[case::empty("")]
    #[case::gap_in_ids("1 127.0.0.1 11001\n3 127.0.0.1 11003\n")]
    #[case::duplicate_id("1 127.0.0.1 11001\n1 127.0.0.1 11002\n")]
    #[case::duplicate_addr("1 127.0.0.1 11001\n2 127.0.0.1 11001\n")]
    #[case::starts_at_zero("0 127.0.0.1 11000\n1 127.0.0.1 11001\n")]
    #[case::garbage("1 not-an-ip 11001\n")]
    fn test_parse_hosts_rejects(#[case] raw: &str) {
        assert!(Hosts::parse(raw).is_err());
    }

    #[rstest]
    #[case::recv_port("127.0.0.1:11001".parse().unwrap(), Some(1))]
    #[case::send_port("127.0.0.1:12003".parse().unwrap(), Some(3))]
    #[case::unknown_port("127.0.0.1:5555".parse().unwrap(), None)]
    #[case::unknown_ip("10.9.9.9:11001".parse().unwrap(), None)]
    fn test_process_by_source_addr(#[case] src: SocketAddr, #[case] expected: Option<u32>) {
        assert_eq!(three_hosts().process_by_source_addr(src), expected);
    }

    #[test]
    fn test_parse_run_mode_perfect_link() {
        assert_eq!(
            RunMode::parse("10 2\n").unwrap(),
            RunMode::PerfectLink { message_count: 10, receiver_id: 2 },
        );
    }

    #[test]
    fn test_parse_run_mode_fifo() {
        assert_eq!(
            RunMode::parse("100\n").unwrap(),
            RunMode::FifoBroadcast { message_count: 100 },
        );
    }

    #[test]
    fn test_parse_run_mode_lattice() {
        let mode = RunMode::parse("2 3 4\n1 2 3\n4 5\n").unwrap();
        assert_eq!(mode, RunMode::LatticeAgreement {
            proposal_count: 2,
            max_proposal_size: 3,
            distinct_values: 4,
            proposals: vec![vec![1, 2, 3], vec![4, 5]],
        });
    }

    #[rstest]
    #[case::empty("")]
    #[case::four_numbers("1 2 3 4\n")]
    #[case::garbage("ten\n")]
    #[case::missing_proposals("2 3 4\n1 2 3\n")]
    #[case::seq_overflow("4294967295\n")]
    fn test_parse_run_mode_rejects(#[case] raw: &str) {
        assert!(RunMode::parse(raw).is_err());
    }
}
