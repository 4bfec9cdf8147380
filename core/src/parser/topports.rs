//! Top destination port accumulator.

/// Default number of most-seen ports reported.
pub const DEFAULT_TOP_PORTS: usize = 10;

/// Transport protocol a counted port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProto {
    Tcp,
    Udp,
}

/// Frequency of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStats {
    pub port: u16,
    pub frequency: u64,
    pub proto: PortProto,
}

impl PortStats {
    pub fn to_string(&self) -> String {
        format!(
            "{}[{}] - {}",
            self.port,
            match self.proto {
                PortProto::Tcp => "TCP",
                PortProto::Udp => "UDP",
            },
            self.frequency
        )
    }
}

/// Counts destination-port frequencies per transport protocol.
///
/// Counting is a plain array increment; extraction of the top N uses a
/// fixed-capacity sorted-insertion buffer over the full port range.
pub struct TopPorts {
    tcp: Vec<u64>,
    udp: Vec<u64>,
    top_count: usize,
}

impl TopPorts {
    pub fn new(top_count: usize) -> Self {
        TopPorts {
            tcp: vec![0; usize::from(u16::MAX) + 1],
            udp: vec![0; usize::from(u16::MAX) + 1],
            top_count,
        }
    }

    #[inline]
    pub fn increment_tcp(&mut self, port: u16) {
        self.tcp[port as usize] += 1;
    }

    #[inline]
    pub fn increment_udp(&mut self, port: u16) {
        self.udp[port as usize] += 1;
    }

    /// Returns up to `top_count` ports ordered by descending frequency.
    pub fn top_ports(&self) -> Vec<PortStats> {
        let mut buffer: Vec<PortStats> = Vec::with_capacity(self.top_count);
        let mut insert = |stats: PortStats| {
            if stats.frequency == 0 {
                return;
            }
            let pos = buffer.partition_point(|p| p.frequency >= stats.frequency);
            if pos < self.top_count {
                if buffer.len() == self.top_count {
                    buffer.pop();
                }
                buffer.insert(pos, stats);
            }
        };
        for (port, &frequency) in self.tcp.iter().enumerate() {
            insert(PortStats {
                port: port as u16,
                frequency,
                proto: PortProto::Tcp,
            });
        }
        for (port, &frequency) in self.udp.iter().enumerate() {
            insert(PortStats {
                port: port as u16,
                frequency,
                proto: PortProto::Udp,
            });
        }
        buffer
    }
}

impl Default for TopPorts {
    fn default() -> Self {
        TopPorts::new(DEFAULT_TOP_PORTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_top_ports_ordering() {
        let mut top = TopPorts::new(3);
        for _ in 0..5 {
            top.increment_tcp(443);
        }
        for _ in 0..3 {
            top.increment_udp(53);
        }
        top.increment_tcp(22);
        top.increment_udp(123);

        let ports = top.top_ports();
        assert_eq!(ports.len(), 3);
        assert_eq!((ports[0].port, ports[0].frequency), (443, 5));
        assert_eq!((ports[1].port, ports[1].frequency), (53, 3));
        assert_eq!(ports[2].frequency, 1);
    }

    #[test]
    fn core_top_ports_empty() {
        let top = TopPorts::new(10);
        assert!(top.top_ports().is_empty());
    }
}
