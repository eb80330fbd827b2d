// Platform backends
//
// Only process access differs between platforms; everything above this
// layer talks to the `ProcessTable` trait.

pub mod process;
