//! Hardware-offload rule programming (§4.4, §6.4 `StartOffload`/`StopOffload`).
//!
//! A real tethering stack hands forwarding to a hardware offload engine via a
//! BPF program; that engine is out of scope here (§1's Non-goals). What this
//! module owns instead is the fast-path nftables acceleration rules fronting
//! it: a single `tethermgr` table with one forward-accept rule per active
//! (downstream, upstream) interface pair. Because nftnl rule deletion needs a
//! handle we don't track, every mutation rebuilds the table from the tracked
//! active-pair set rather than deleting individual rules — the same
//! table-level-delete-cascades idiom the routing helper uses for its own
//! firewall rules.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::sync::Mutex;

use crate::error::Error;

pub trait NfTablesOps: Send + Sync {
    fn start_offload(&self, downstream: &str, upstream: &str) -> Result<(), Error>;
    fn stop_offload(&self, downstream: &str) -> Result<(), Error>;
    fn teardown_stale(&self) -> Result<(), Error>;
}

#[cfg(target_os = "linux")]
mod real {
    use super::*;
    use nftnl::{Batch, Chain, ChainType, Hook, MsgType, ProtoFamily, Rule, Table};
    use nftnl::nft_expr;

    const TABLE_NAME: &std::ffi::CStr = c"tethermgr";
    const FORWARD_CHAIN_NAME: &std::ffi::CStr = c"TETHERMGR_FORWARD";

    pub struct RealNfTablesOps {
        active_pairs: Mutex<BTreeSet<(String, String)>>,
    }

    impl RealNfTablesOps {
        pub fn new() -> Self {
            RealNfTablesOps { active_pairs: Mutex::new(BTreeSet::new()) }
        }

        fn rebuild(&self, pairs: &BTreeSet<(String, String)>) -> Result<(), Error> {
            let _ = delete_table(true);
            if pairs.is_empty() {
                return Ok(());
            }

            let table = Table::new(TABLE_NAME, ProtoFamily::Ipv4);
            let mut batch = Batch::new();
            batch.add(&table, MsgType::Add);

            let mut chain = Chain::new(FORWARD_CHAIN_NAME, &table);
            chain.set_hook(Hook::Forward, 0);
            chain.set_type(ChainType::Filter);
            batch.add(&chain, MsgType::Add);

            for (downstream, upstream) in pairs {
                let down_cstr = CString::new(downstream.as_str())
                    .map_err(|e| Error::NfTables(format!("invalid downstream interface name: {e}")))?;
                let up_cstr = CString::new(upstream.as_str())
                    .map_err(|e| Error::NfTables(format!("invalid upstream interface name: {e}")))?;

                let mut rule = Rule::new(&chain);
                rule.add_expr(&nft_expr!(meta iifname));
                rule.add_expr(&nft_expr!(cmp == nftnl::expr::InterfaceName::Exact(down_cstr)));
                rule.add_expr(&nft_expr!(meta oifname));
                rule.add_expr(&nft_expr!(cmp == nftnl::expr::InterfaceName::Exact(up_cstr)));
                rule.add_expr(&nft_expr!(verdict accept));
                batch.add(&rule, MsgType::Add);
            }

            let finalized = batch.finalize();
            send_batch(&finalized)
        }
    }

    fn send_batch(batch: &nftnl::FinalizedBatch) -> Result<(), Error> {
        let socket = mnl::Socket::new(mnl::Bus::Netfilter)
            .map_err(|e| Error::NfTables(format!("failed to open netlink socket: {e}")))?;
        let portid = socket.portid();

        socket.send_all(batch).map_err(|e| Error::NfTables(format!("failed to send batch: {e}")))?;

        let mut buffer = vec![0; nftnl::nft_nlmsg_maxsize() as usize];
        let mut expected_seqs = batch.sequence_numbers();

        while !expected_seqs.is_empty() {
            let messages = socket
                .recv(&mut buffer[..])
                .map_err(|e| Error::NfTables(format!("failed to receive netlink response: {e}")))?;
            for message in messages {
                let message = message.map_err(|e| Error::NfTables(format!("netlink message error: {e}")))?;
                let expected_seq = expected_seqs
                    .next()
                    .ok_or_else(|| Error::NfTables("unexpected ACK from netfilter".into()))?;
                mnl::cb_run(message, expected_seq, portid)
                    .map_err(|e| Error::NfTables(format!("netlink ACK error: {e}")))?;
            }
        }

        Ok(())
    }

    fn delete_table(ignore_enoent: bool) -> Result<(), Error> {
        let table = Table::new(TABLE_NAME, ProtoFamily::Ipv4);
        let mut batch = Batch::new();
        batch.add(&table, MsgType::Del);
        let finalized = batch.finalize();

        match send_batch(&finalized) {
            Ok(()) => Ok(()),
            Err(ref e) if ignore_enoent => {
                let msg = format!("{e}");
                if msg.contains("No such file or directory") || msg.contains("ENOENT") {
                    tracing::debug!("tethermgr nftables table does not exist, nothing to delete");
                    Ok(())
                } else {
                    Err(Error::NfTables(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    impl NfTablesOps for RealNfTablesOps {
        fn start_offload(&self, downstream: &str, upstream: &str) -> Result<(), Error> {
            let mut pairs = self.active_pairs.lock().expect("mutex poisoned");
            pairs.insert((downstream.to_string(), upstream.to_string()));
            self.rebuild(&pairs)
        }

        fn stop_offload(&self, downstream: &str) -> Result<(), Error> {
            let mut pairs = self.active_pairs.lock().expect("mutex poisoned");
            pairs.retain(|(d, _)| d != downstream);
            self.rebuild(&pairs)
        }

        fn teardown_stale(&self) -> Result<(), Error> {
            let mut pairs = self.active_pairs.lock().expect("mutex poisoned");
            pairs.clear();
            delete_table(true)
        }
    }
}

#[cfg(target_os = "linux")]
pub use real::RealNfTablesOps;
