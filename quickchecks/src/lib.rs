//! Property checks for `chunkdb` live under `tests/`.
