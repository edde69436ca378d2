// stats.rs - Consolidated statistics types

#[derive(Debug, Default, Clone)]
pub struct SocketStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reliables_retransmitted: u64,
    pub duplicates_suppressed: u64,
}
