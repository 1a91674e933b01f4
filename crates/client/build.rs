use std::error::Error;

use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn Error>> {
    // Outside a git checkout vergen falls back to placeholder values instead of failing.
    EmitBuilder::builder()
        .build_timestamp()
        .cargo_target_triple()
        .git_describe(true, true, None)
        .git_dirty(false)
        .emit()?;
    Ok(())
}
