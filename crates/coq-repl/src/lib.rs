//! Async client for `coqidetop` using its XML protocol over stdio.
//!
//! This crate launches a backend process, encodes calls, assembles replies
//! from the unframed output stream, and tracks the document's state ids so
//! sentences can be added and undone.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use coq_repl::{CoqConfig, CoqSession};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoqConfig::new("coqidetop");
//! let encoding = config.text_encoding()?;
//!
//! let mut session = CoqSession::initialize(config).await?;
//! session.advance("Lemma id (P : Prop) : P -> P.", encoding).await?;
//! session.advance("Proof.", encoding).await?;
//! let response = session.advance("intros.", encoding).await?;
//! if let Some(message) = response.error_message() {
//!     eprintln!("{message}");
//! }
//! // Undo the last two sentences that went through.
//! session.rewind(2).await?;
//! let goals = session.goals(None).await?;
//! println!("{goals:?}");
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Backend failures (a sentence that does not typecheck, say) are returned
//! as [`Response::Err`]. Only launch, protocol, liveness and I/O problems
//! are [`CoqError`]s.

pub mod project;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;
pub mod value;
pub mod xml;

pub use protocol::{decode_response, decode_text, decode_value, encode_call, encode_value, Response};
pub use session::CoqSession;
pub use transport::{CoqProcess, MessageReader, RawReply, ReadError};
pub use types::{CoqConfig, CoqError};
pub use value::{Evar, Goal, Goals, OptionState, RouteId, Side, StateId, Status, Value};
pub use xml::Element;
