use std::panic;
use std::process;

use reclaim_cli::run;

fn main() -> anyhow::Result<()> {
    let orig_hook = panic::take_hook();
    // catch panics in the prefetch thread so a crash there still sets a useful exit code
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(1);
    }));
    run()
}
