//! Wire formats and low-level connection primitives
//!
//! - `document`: the length-prefixed self-describing record every message
//!   on the wire is encoded as
//! - `conn`: the framed document codec over a bidirectional stream
//! - `dialer`: the outbound dialing capability (SOCKS seam)

pub mod conn;
pub mod dialer;
pub mod document;

pub use conn::{Conn, DocReader, DocWriter};
pub use dialer::{BoxedConduit, Conduit, Dialer, TcpDialer};
pub use document::{Doc, DocBuilder, DocError, Element, OwnedElement, Value};
