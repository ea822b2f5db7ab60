use brokerage_ipc::DuplexPipe;

/// Copies bytes bidirectionally between `a` and `b` until either direction
/// hits EOF or an error, then lets both halves drop.
pub(crate) async fn pump(a: DuplexPipe, b: DuplexPipe) {
	let (mut a_read, mut a_write) = tokio::io::split(a);
	let (mut b_read, mut b_write) = tokio::io::split(b);

	let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
	let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);

	if let Err(e) = tokio::try_join!(a_to_b, b_to_a) {
		tracing::debug!(error = %e, "relay pump ended");
	}
}
