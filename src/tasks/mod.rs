pub mod poll_fallback;
