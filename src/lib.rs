//! Mesh voice rooms: a signaling relay that admits up to ten participants per
//! room and forwards WebRTC negotiation between them, plus the client-side
//! mesh orchestrator that dials every other participant directly.
pub mod config;
pub mod directory;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod utils {
    pub mod jwt;
    pub mod stats;
}
