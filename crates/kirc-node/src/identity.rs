use std::path::Path;

use anyhow::Context;
use tracing::info;

use kirc_crypto::Identity;

/// Read the identity secret at `path`, or generate one and write it there.
pub fn load_or_create(path: &Path) -> anyhow::Result<Identity> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let identity = Identity::from_secret_base64(encoded.trim())
            .with_context(|| format!("parsing {}", path.display()))?;
        info!("Loaded identity {} from {}", identity.fingerprint(), path.display());
        return Ok(identity);
    }

    let identity = Identity::generate();
    std::fs::write(path, identity.secret_to_base64())
        .with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!("Generated identity {} at {}", identity.fingerprint(), path.display());
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_restart() {
        let path = std::env::temp_dir().join(format!("kirc-{}.key", uuid::Uuid::new_v4()));

        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.public_key_base64(), second.public_key_base64());

        std::fs::write(&path, "not a key").unwrap();
        assert!(load_or_create(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
