//! Supplementary mounts in fstab(5) syntax.

/// Mount options we understand; anything else goes to the filesystem as data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    pub nosuid: bool,
    pub nodev: bool,
    pub noexec: bool,
    pub sync: bool,
    pub remount: bool,
    pub bind: bool,
    pub recursive: bool,
    pub noatime: bool,
    pub nodiratime: bool,
    pub relatime: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub spec: String,
    pub file: String,
    pub vfstype: String,
    pub options: MountOptions,
    /// Comma-joined options handed to the filesystem.
    pub data: String,
    pub freq: u32,
    pub passno: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FstabError {
    #[error("line {line}: expected at least 4 fields, got {got}")]
    TooFewFields { line: usize, got: usize },
    #[error("line {line}: too many fields")]
    TooManyFields { line: usize },
    #[error("line {line}: {field} is not a number: {value:?}")]
    BadNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// Parses a whole table. `#` starts a comment; blank lines are ignored.
pub fn parse(text: &str) -> Result<Vec<FstabEntry>, FstabError> {
    let mut entries = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let content = raw.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }

        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(FstabError::TooFewFields {
                line,
                got: fields.len(),
            });
        }
        if fields.len() > 6 {
            return Err(FstabError::TooManyFields { line });
        }

        let number = |pos: usize, field: &'static str| -> Result<u32, FstabError> {
            fields.get(pos).map_or(Ok(0), |v| {
                v.parse().map_err(|_| FstabError::BadNumber {
                    line,
                    field,
                    value: v.to_string(),
                })
            })
        };

        let (options, data) = parse_options(fields[3]);
        entries.push(FstabEntry {
            spec: fields[0].to_string(),
            file: fields[1].to_string(),
            vfstype: fields[2].to_string(),
            options,
            data,
            freq: number(4, "freq")?,
            passno: number(5, "passno")?,
        });
    }
    Ok(entries)
}

/// Splits `mntops` into known flags and the leftover data string.
pub fn parse_options(mntops: &str) -> (MountOptions, String) {
    let mut options = MountOptions::default();
    let mut data = Vec::new();
    for opt in mntops.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" => options.read_only = true,
            "rw" => options.read_only = false,
            "nosuid" => options.nosuid = true,
            "nodev" => options.nodev = true,
            "noexec" => options.noexec = true,
            "sync" => options.sync = true,
            "remount" => options.remount = true,
            "bind" => options.bind = true,
            "rbind" => {
                options.bind = true;
                options.recursive = true;
            }
            "noatime" => options.noatime = true,
            "nodiratime" => options.nodiratime = true,
            "relatime" => options.relatime = true,
            "defaults" => {}
            other => data.push(other),
        }
    }
    (options, data.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table() {
        let text = "\
# scratch space
tmpfs /tmp tmpfs nosuid,nodev,size=64m 0 0

/srv/data /mnt/data none rbind,ro   # read-only view
proc /proc proc defaults
";
        let entries = parse(text).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].spec, "tmpfs");
        assert_eq!(entries[0].file, "/tmp");
        assert!(entries[0].options.nosuid && entries[0].options.nodev);
        assert_eq!(entries[0].data, "size=64m");

        let data = &entries[1];
        assert!(data.options.bind && data.options.recursive && data.options.read_only);
        assert!(data.data.is_empty());
        assert_eq!((data.freq, data.passno), (0, 0));

        assert_eq!(entries[2].options, MountOptions::default());
    }

    #[test]
    fn test_numbers() {
        let entries = parse("/dev/sda1 / ext4 rw 1 2").unwrap();
        assert_eq!((entries[0].freq, entries[0].passno), (1, 2));

        assert_eq!(
            parse("a b c d x").unwrap_err(),
            FstabError::BadNumber {
                line: 1,
                field: "freq",
                value: "x".into(),
            }
        );
    }

    #[test]
    fn test_field_counts() {
        assert_eq!(
            parse("\n/a /b\n").unwrap_err(),
            FstabError::TooFewFields { line: 2, got: 2 }
        );
        assert_eq!(
            parse("a b c d 0 0 extra").unwrap_err(),
            FstabError::TooManyFields { line: 1 }
        );
    }

    #[test]
    fn test_options_order() {
        let (options, data) = parse_options("ro,uid=1000,rw,mode=0755");
        assert!(!options.read_only);
        assert_eq!(data, "uid=1000,mode=0755");
    }
}
