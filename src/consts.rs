// Tuning constants and safety caps

// Interceptor count above which the interceptor set is held in an array and walked by a loop
pub const DEFAULT_MO_ARRAY_THRESHOLD: usize = 4;

// Widest interceptor set whose per-hook presence fits a precomputed i32 slot mask
pub const FEATURE_MASK_WIDTH: usize = 32;

// Interpreter: maximum instructions executed by a single Vm before it gives up
pub const VM_MAX_STEPS: u64 = 5_000_000;
// Interpreter: maximum call depth
pub const VM_MAX_DEPTH: usize = 256;

// State sentinels used by lowered state machines
pub const ASYNC_STATE_NOT_STARTED: i32 = -1;
pub const ITERATOR_STATE_NOT_STARTED: i32 = 0;
pub const ASYNC_ITERATOR_STATE_NOT_STARTED: i32 = -3;
pub const STATE_FINISHED: i32 = -2;
