#![no_main]

use libfuzzer_sys::fuzz_target;
use tokio::runtime::Runtime;
use wsconn::frame::read_header;

// The header parser is the one piece of this crate that runs on fully untrusted, attacker
// controlled bytes before any higher-level framing logic gets a say. It should never panic
// on any input, only return Ok or Err.
fuzz_target!(|data: &[u8]| {
    let runtime = Runtime::new().unwrap();
    let mut cursor = std::io::Cursor::new(data);
    runtime.block_on(async {
        let _ = read_header(&mut cursor).await;
    });
});
