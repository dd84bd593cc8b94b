//! courier - control client for the courier daemon
//!
//! ```bash
//! courier sessions
//! courier dispatch 628123 628999 ping -n 3
//! courier watch
//! ```

fn main() -> anyhow::Result<()> {
    courier_cli::cli::run()
}
