#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! reachd library: every building block of the server, usable on its own.
//!
//! | Module | Role |
//! |--------|------|
//! | `ports` | PortPool: sticky `(server, service) -> port` mapping within a range |
//! | `tunnel` | SSH broker for reverse-forwarding agents, plus the tunnel session registry |
//! | `sessions` | Registry of live terminal relays |
//! | `connector` | Open a PTY over SSH or a container exec |
//! | `relay` | WebSocket <-> terminal byte pump with the `0x00` control sub-protocol |
//! | `sftp` | One-shot SFTP file operations |
//! | `resolve` | Server id to effective endpoint and credential |
//! | `store` | Server records, secrets, token validation, lifecycle hooks |
//! | `activity` | In-memory audit ring buffer |
//! | `auth` | API key middleware |
//! | `config` | TOML + env configuration |
//! | `routes`, `ws` | HTTP and WebSocket surface |

pub mod activity;
pub mod auth;
pub mod config;
pub mod connector;
pub mod ports;
pub mod relay;
pub mod resolve;
pub mod routes;
pub mod sessions;
pub mod sftp;
pub mod state;
pub mod store;
pub mod tunnel;
pub mod ws;

pub use activity::ActivityLog;
pub use auth::ApiKey;
pub use config::Config;
pub use ports::PortPool;
pub use state::AppState;
pub use tunnel::broker::TunnelBroker;
