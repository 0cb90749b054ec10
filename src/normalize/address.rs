use mailparse::{MailAddr, MailHeader};

/// One mailbox named in an address header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    /// Lowercased and trimmed.
    pub email: String,
}

impl Address {
    fn new(name: Option<&str>, email: &str) -> Option<Self> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return None;
        }
        let name = name
            .map(|name| name.trim().trim_matches('"').trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        Some(Self { name, email })
    }
}

/// Every address in a From/To/Cc/Bcc header, group members included.
pub fn header_addresses(header: &MailHeader<'_>) -> Vec<Address> {
    match mailparse::addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![(info.display_name.clone(), info.addr.clone())],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| (info.display_name.clone(), info.addr.clone()))
                    .collect(),
            })
            .filter_map(|(name, email)| Address::new(name.as_deref(), &email))
            .collect(),
        Err(_) => split_address_list(&header.get_value()),
    }
}

/// Lenient comma split for headers the strict parser rejects.
pub fn split_address_list(raw: &str) -> Vec<Address> {
    let mut addresses = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                addresses.extend(parse_entry(&current));
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    addresses.extend(parse_entry(&current));

    addresses
}

// "Display Name <email@example.com>" or a bare address.
fn parse_entry(entry: &str) -> Option<Address> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }

    if let (Some(start), Some(end)) = (entry.rfind('<'), entry.rfind('>')) {
        if start < end {
            return Address::new(Some(&entry[..start]), &entry[start + 1..end]);
        }
    }

    if entry.contains('@') {
        return Address::new(None, entry);
    }

    None
}
