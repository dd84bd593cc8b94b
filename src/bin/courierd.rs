//! courier daemon - session lifecycles, unit registry and dispatch
//!
//! ```bash
//! courierd start        # foreground
//! courierd start -d     # background
//! courierd stop
//! courierd status
//! ```

fn main() -> anyhow::Result<()> {
    courierd::cli::run()
}
