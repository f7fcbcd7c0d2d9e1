//! Pipeline Tests Module
//!
//! End-to-end runs of discovery and download over a scripted browser and a
//! scripted fetcher.
