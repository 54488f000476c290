use crate::session::ScanSession;
use crate::types::PortResult;

pub const CSV_HEADER: [&str; 3] = ["port", "service", "status"];

/// Serialize open ports as CSV: a `port,service,status` header, then one
/// row per result in ascending port order.
pub fn export_csv(results: &[PortResult]) -> csv::Result<Vec<u8>> {
    let mut sorted: Vec<&PortResult> = results.iter().filter(|r| r.is_open).collect();
    sorted.sort_by_key(|r| r.port);
    sorted.dedup_by_key(|r| r.port);

    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADER)?;
    for r in sorted {
        wtr.write_record([r.port.to_string().as_str(), r.service.as_str(), "open"])?;
    }
    wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}

/// Export everything the session has found so far, whatever its state.
pub fn export_session(session: &ScanSession) -> csv::Result<Vec<u8>> {
    export_csv(&session.open_results())
}

/// Download file name for a session's export.
pub fn export_filename(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(8).collect();
    format!("scan_result_{prefix}.csv")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(port: u16, service: &str) -> PortResult {
        PortResult { port, is_open: true, service: service.into() }
    }

    #[test]
    fn empty_export_is_header_only() {
        let out = export_csv(&[]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "port,service,status\n");
    }

    #[test]
    fn rows_are_sorted_by_port() {
        let out = export_csv(&[open(443, "https"), open(22, "ssh"), open(80, "http")]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "port,service,status\n22,ssh,open\n80,http,open\n443,https,open\n"
        );
    }

    #[test]
    fn closed_and_duplicate_entries_are_skipped() {
        let closed = PortResult { port: 21, is_open: false, service: "ftp".into() };
        let out = export_csv(&[open(80, "http"), closed, open(80, "http")]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "port,service,status\n80,http,open\n");
    }

    #[test]
    fn filename_uses_id_prefix() {
        assert_eq!(export_filename("0123456789abcdef"), "scan_result_01234567.csv");
        assert_eq!(export_filename("cli"), "scan_result_cli.csv");
    }
}
