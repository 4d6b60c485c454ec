//! End-to-end tests for the HTTP surface live under `tests/`.
