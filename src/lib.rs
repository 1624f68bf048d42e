//! sandbox_httpd - Minimal HTTP/1.1 static file server with peer redirects
//!
//! Serves regular files from a document root to `GET` and `HEAD` requests.
//! A file that is not in the root may be held by a peer server. Peers are
//! listed in a registry file, and requests for their files are answered with
//! `302 Found` pointing at the peer.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1** only, with persistent connections and pipelining
//! - **GET** and **HEAD**. Any other method is answered with `501 Not Implemented`
//! - Requests carry no body. `Content-Type` and `Content-Length` in a request
//!   are rejected with `400 Bad Request`
//!
//! # Sandbox
//!
//! A target is served only when it matches `^/[A-Za-z0-9./-]*$`, never climbs
//! above the root through `..` components, and names a regular file. Targets
//! that fail any of these checks are indistinguishable from missing files.
//!
//! # Examples
//!
//! ```no_run
//! use sandbox_httpd::{PeerRegistry, Server};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("0.0.0.0:8080").await.unwrap())
//!         .root("/srv/www")
//!         .lookup(PeerRegistry::new("/srv/peers.txt"))
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! With a registry containing
//! ```text
//! /big.iso\t10.0.0.5\t9090
//! ```
//! a request for a missing `/big.iso` is answered with
//! ```text
//! HTTP/1.1 302 Found
//! Location: http://10.0.0.5:9090/big.iso
//! ```

pub(crate) mod http {
    pub(crate) mod buffer;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod fs {
    pub(crate) mod registry;
    pub(crate) mod sandbox;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{Error, ErrorKind, IoError},
    fs::registry::{PeerLookup, PeerRegistry},
    http::{
        request::{ParserRules, Request, SeenHeaders},
        types::{Method, StatusCode},
    },
    server::server_impl::{bind_listener, Server, ServerBuilder},
};
