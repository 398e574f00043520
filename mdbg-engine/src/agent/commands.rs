// Agent command and event identifiers
//
// Command Sets:
// 1 = Process
// 2 = Breakpoint
// 3 = Stepper
// 4 = Frame
// 5 = Metadata
// 6 = Value
// 7 = Eval
// 8 = Handle
// 64 = Event (agent to debugger only)

pub mod command_sets {
    pub const PROCESS: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const STEPPER: u8 = 3;
    pub const FRAME: u8 = 4;
    pub const METADATA: u8 = 5;
    pub const VALUE: u8 = 6;
    pub const EVAL: u8 = 7;
    pub const HANDLE: u8 = 8;
    pub const EVENT: u8 = 64;
}

// Process commands (set 1)
pub mod process_commands {
    pub const LAUNCH: u8 = 1;
    pub const ATTACH: u8 = 2;
    pub const DETACH: u8 = 3;
    pub const TERMINATE: u8 = 4;
    pub const CONTINUE: u8 = 5;
    pub const STOP: u8 = 6;
    pub const THREADS: u8 = 7;
}

// Breakpoint commands (set 2)
pub mod breakpoint_commands {
    pub const CREATE: u8 = 1;
    pub const SET_ACTIVE: u8 = 2;
}

// Stepper commands (set 3)
pub mod stepper_commands {
    pub const STEP: u8 = 1;
    pub const CANCEL: u8 = 2;
}

// Frame commands (set 4)
pub mod frame_commands {
    pub const FRAMES: u8 = 1;
    pub const ARGUMENTS: u8 = 2;
    pub const LOCALS: u8 = 3;
}

// Metadata commands (set 5)
pub mod metadata_commands {
    pub const METHOD_DESC: u8 = 1;
    pub const MODULE_SYMBOLS: u8 = 2;
    pub const TYPE_OF: u8 = 3;
    pub const TYPE_INFO: u8 = 4;
    pub const FIND_TYPE: u8 = 5;
}

// Value commands (set 6)
pub mod value_commands {
    pub const READ_PRIMITIVE: u8 = 1;
    pub const READ_STRING: u8 = 2;
    pub const UNBOX: u8 = 3;
    pub const OBJECT_ADDRESS: u8 = 4;
    pub const ARRAY_DIMENSIONS: u8 = 5;
    pub const ARRAY_ELEMENT: u8 = 6;
    pub const FIELD_VALUE: u8 = 7;
    pub const STATIC_FIELD_VALUE: u8 = 8;
    pub const CREATE_PRIMITIVE: u8 = 9;
    pub const CREATE_NULL: u8 = 10;
}

// Eval commands (set 7)
pub mod eval_commands {
    pub const CALL: u8 = 1;
    pub const NEW_STRING: u8 = 2;
    pub const ABORT: u8 = 3;
}

// Handle commands (set 8)
pub mod handle_commands {
    pub const CREATE_STRONG: u8 = 1;
    pub const RELEASE: u8 = 2;
}

// Event set (set 64)
pub mod event_commands {
    pub const COMPOSITE: u8 = 100;
}

pub mod event_kinds {
    pub const PROCESS_CREATED: u8 = 1;
    pub const PROCESS_EXITED: u8 = 2;
    pub const DOMAIN_CREATED: u8 = 3;
    pub const THREAD_CREATED: u8 = 4;
    pub const THREAD_EXITED: u8 = 5;
    pub const MODULE_LOADED: u8 = 6;
    pub const MODULE_UNLOADED: u8 = 7;
    pub const BREAKPOINT: u8 = 8;
    pub const STEP_COMPLETE: u8 = 9;
    pub const BREAK: u8 = 10;
    pub const EXCEPTION: u8 = 11;
    pub const EVAL_COMPLETE: u8 = 12;
    pub const EVAL_EXCEPTION: u8 = 13;
}

// Value kind tags
pub mod value_tags {
    pub const PRIMITIVE: u8 = 1;
    pub const STRING: u8 = 2;
    pub const OBJECT: u8 = 3;
    pub const ARRAY: u8 = 4;
    pub const BOXED: u8 = 5;
    pub const NULL: u8 = 6;
}

// Step modes
pub mod step_modes {
    pub const RANGE: u8 = 1;
    pub const INSTRUCTION: u8 = 2;
    pub const OUT: u8 = 3;
}
