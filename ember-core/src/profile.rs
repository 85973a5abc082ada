/// Start serving puffin scopes over TCP. Keep the returned server alive for as long as profiling
/// data should be streamed.
pub fn initialize(enable: bool) -> Result<Option<puffin_http::Server>, anyhow::Error> {
    if !enable {
        return Ok(None);
    }

    let server_addr = format!("127.0.0.1:{}", puffin_http::DEFAULT_PORT);
    let server = puffin_http::Server::new(&server_addr)?;
    profiling::puffin::set_scopes_on(true);

    log::info!("Serving profile data on {server_addr}");
    Ok(Some(server))
}
