//! Connection-level tests driven by a scripted monitor peer.

mod support;
