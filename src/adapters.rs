use crate::system::HostNetwork;

/// Listed first; binding a box to it removes its `BindAdapter` setting.
pub const CLEAN_ADAPTER: &str = "clean";

/// `"clean"` followed by every interface the host reports.
pub fn list_adapters(host: &dyn HostNetwork) -> Vec<String> {
    let mut adapters = vec![CLEAN_ADAPTER.to_string()];
    adapters.extend(host.interface_names());
    log::debug!("[adapters] {} choices: {:?}", adapters.len(), adapters);
    adapters
}

/// Interface names from `netsh interface show interface`.
///
/// Rows are `<Admin State> <State> <Type> <Interface Name>`; the name may
/// contain spaces, so only the first three gaps split. When the dashed rule
/// under the column titles is present, only rows after it are read.
pub fn parse_interface_table(output: &str) -> Vec<String> {
    let lines: Vec<&str> = output.lines().collect();
    let body = match lines.iter().position(|line| is_rule(line)) {
        Some(index) => &lines[index + 1..],
        None => &lines[..],
    };

    body.iter()
        .filter_map(|line| match split_columns(line, 4).as_slice() {
            [_, _, _, name] => Some(name.to_string()),
            _ => None,
        })
        .collect()
}

fn is_rule(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c == '-')
}

/// Whitespace split producing at most `count` fields; the last keeps the rest.
fn split_columns(line: &str, count: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim();
    while !rest.is_empty() {
        if fields.len() + 1 == count {
            fields.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                fields.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                fields.push(rest);
                break;
            }
        }
    }
    fields
}
