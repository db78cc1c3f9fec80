//! Integration test suite for conductor.
//!
//! These tests drive the public API end to end: the execution manager
//! against an in-memory or JSON file store, the message bus with real
//! concurrent receivers, resume analysis over recorded history, and the
//! workflow runner across failure and resume.
//!
//! # Test Categories
//!
//! - `manager`: concurrency bound, settlement, timeout and cancellation
//! - `bus`: FIFO delivery, request/response correlation, broadcasts
//! - `resume`: resume offsets and resumability over stored history
//! - `workflow_e2e`: full workflow runs, failure and resume
//!
//! All agents are in-process mocks from `fixtures`, except for a few unix
//! tests that run `cat` through `CommandAgent`.


mod bus;
mod resume;
mod workflow_e2e;
