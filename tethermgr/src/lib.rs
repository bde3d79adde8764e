//! Orchestrator library target: the tethering control plane's state
//! machines, decoupled from the process (signals, sockets, config file) that
//! `main.rs` wires them into. Exposed as a library so the system-tests crate
//! can drive `TetherOrchestrator` and its collaborators directly.

pub mod orchestrator;
