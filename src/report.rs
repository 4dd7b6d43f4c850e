use std::path::Path;

use color_eyre::eyre::{Result, WrapErr};
use tokio::{
	fs::OpenOptions,
	io::{AsyncWrite, AsyncWriteExt},
	sync::Mutex,
};
use tracing::{debug, trace};

/// Append-only diagnostic log shared by all workers.
///
/// Each report is one line, written and flushed while holding the lock, then
/// echoed to stdout unless the reporter is quiet.
pub struct ErrorReporter {
	sink: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
	echo: bool,
}

impl ErrorReporter {
	pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		debug!(?path, "opening error log");

		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.await
			.wrap_err_with(|| format!("opening error log {}", path.display()))?;

		Ok(Self::new(file))
	}

	pub fn new(sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
		Self {
			sink: Mutex::new(Box::new(sink)),
			echo: true,
		}
	}

	pub fn quiet(mut self) -> Self {
		self.echo = false;
		self
	}

	pub async fn report(&self, message: impl AsRef<str>) -> Result<()> {
		let message = message.as_ref();
		let line = format!("{}\n", message);

		let mut sink = self.sink.lock().await;
		sink.write_all(line.as_bytes())
			.await
			.wrap_err("writing to error log")?;
		sink.flush().await.wrap_err("flushing error log")?;
		trace!(bytes=%line.len(), "wrote error report");

		if self.echo {
			println!("{}", message);
		}

		Ok(())
	}
}
