//! Parsers for the output of the OS process tools.

/// PIDs with a local endpoint on `port` in `netstat -ano` output.
///
/// Rows look like `TCP 127.0.0.1:8000 0.0.0.0:0 LISTENING 4242` (UDP rows
/// have no state column). Only the local address is matched, so clients
/// connected *to* the port are left alone.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let proto = cols.first()?;
            if !proto.eq_ignore_ascii_case("tcp") && !proto.eq_ignore_ascii_case("udp") {
                return None;
            }
            let local = cols.get(1)?;
            if !local.ends_with(&suffix) {
                return None;
            }
            cols.last()?.parse::<u32>().ok()
        })
        .filter(|pid| *pid != 0)
        .collect();

    pids.sort_unstable();
    pids.dedup();
    pids
}

/// PIDs from tools that print one per line (`lsof -t`, `pgrep`).
pub fn parse_pid_lines(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0)
        .collect();

    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Whether `tasklist /FO CSV /NH` output contains a row for `image`.
///
/// When nothing matches, tasklist prints an `INFO:` line instead of rows.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn parse_tasklist(output: &str, image: &str) -> bool {
    output.lines().any(|line| {
        line.split(',')
            .next()
            .map(|field| field.trim().trim_matches('"'))
            .is_some_and(|name| name.eq_ignore_ascii_case(image))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETSTAT: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1020
  TCP    127.0.0.1:8000         0.0.0.0:0              LISTENING       4242
  TCP    127.0.0.1:8000         127.0.0.1:51234        ESTABLISHED     4242
  TCP    127.0.0.1:51234        127.0.0.1:8000         ESTABLISHED     7777
  TCP    127.0.0.1:8000         127.0.0.1:51100        TIME_WAIT       0
  TCP    [::]:8000              [::]:0                 LISTENING       5151
  TCP    0.0.0.0:18000          0.0.0.0:0              LISTENING       9999
  UDP    0.0.0.0:8000           *:*                                    3131
";

    #[test]
    fn test_netstat_local_port_only() {
        let pids = parse_netstat(NETSTAT, 8000);
        assert_eq!(pids, vec![3131, 4242, 5151]);
    }

    #[test]
    fn test_netstat_no_match() {
        assert!(parse_netstat(NETSTAT, 9000).is_empty());
        assert!(parse_netstat("", 8000).is_empty());
    }

    #[test]
    fn test_pid_lines() {
        assert_eq!(parse_pid_lines("123\n 456 \n\n123\nnot-a-pid\n"), vec![123, 456]);
        assert!(parse_pid_lines("").is_empty());
    }

    #[test]
    fn test_tasklist() {
        let running = "\"terminal64.exe\",\"6120\",\"Console\",\"1\",\"312,448 K\"\n";
        assert!(parse_tasklist(running, "terminal64.exe"));
        assert!(parse_tasklist(running, "Terminal64.EXE"));

        let absent = "INFO: No tasks are running which match the specified criteria.\n";
        assert!(!parse_tasklist(absent, "terminal64.exe"));
    }
}
