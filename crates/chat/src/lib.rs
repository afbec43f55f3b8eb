//! Chat integration - Mattermost bot interface
//!
//! This crate turns chat traffic into poll operations:
//! - **Commands** (`commands`) - tokenizer and router for `/create_vote`, `/vote`, `/results`,
//!   `/end_vote`, `/delete_vote`
//! - **Events** (`events`) - filters posted messages and delivers replies
//! - **Supervisor** (`supervisor`) - listen loop with a single reconnect on stream loss
//! - **Mattermost** (`mattermost`) - REST client and websocket transport
//!
//! # Architecture
//!
//! ```text
//! websocket → ReconnectionSupervisor → EventDispatcher → CommandRouter → PollRepository
//!                                           ↓
//!                              MessageSender ← reply text
//! ```

pub mod commands;
pub mod events;
pub mod mattermost;
pub mod supervisor;
