/// cloud-init user data for a new server: the orchestrator's ssh key and,
/// when the server has a tunnel, the connector running with its token.
pub fn build_cloud_init(ssh_pub: Option<&str>, tunnel_token: Option<&str>) -> String {
    let mut cloud = String::new();
    cloud.push_str("#cloud-config\n");
    if let Some(key) = ssh_pub.map(str::trim).filter(|k| !k.is_empty()) {
        cloud.push_str("ssh_authorized_keys:\n");
        cloud.push_str(&format!("  - {}\n", key));
    }

    let Some(token) = tunnel_token.map(str::trim).filter(|t| !t.is_empty()) else {
        return cloud;
    };

    cloud.push_str("\nwrite_files:\n");
    cloud.push_str("  - path: /etc/cloudflared/token\n");
    cloud.push_str("    permissions: '0600'\n");
    cloud.push_str("    owner: root:root\n");
    cloud.push_str("    content: |\n");
    cloud.push_str(&format!("      {}\n", token));
    cloud.push_str("  - path: /usr/local/bin/agenthost-tunnel-bootstrap.sh\n");
    cloud.push_str("    permissions: '0755'\n");
    cloud.push_str("    content: |\n");
    cloud.push_str("      #!/usr/bin/env bash\n");
    cloud.push_str("      set -euo pipefail\n");
    cloud.push_str("      echo '[agenthost] tunnel bootstrap starting'\n");
    cloud.push_str("      if ! command -v cloudflared >/dev/null 2>&1; then\n");
    cloud.push_str("        arch=\"$(dpkg --print-architecture)\"\n");
    cloud.push_str("        curl -fsSL -o /tmp/cloudflared.deb \"https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-${arch}.deb\"\n");
    cloud.push_str("        dpkg -i /tmp/cloudflared.deb\n");
    cloud.push_str("      fi\n");
    cloud.push_str("      cloudflared service install \"$(cat /etc/cloudflared/token)\"\n");
    cloud.push_str("      systemctl enable --now cloudflared\n");
    cloud.push_str("      echo '[agenthost] tunnel bootstrap done'\n");
    cloud.push_str("\nruncmd:\n");
    cloud.push_str("  - [ bash, /usr/local/bin/agenthost-tunnel-bootstrap.sh ]\n");
    cloud
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_only() {
        let c = build_cloud_init(Some(" ssh-ed25519 AAAA orchestrator\n"), None);
        assert_eq!(
            c,
            "#cloud-config\nssh_authorized_keys:\n  - ssh-ed25519 AAAA orchestrator\n"
        );
    }

    #[test]
    fn tunnel_token_installs_connector() {
        let c = build_cloud_init(None, Some("tok-123"));
        assert!(c.starts_with("#cloud-config\n"));
        assert!(!c.contains("ssh_authorized_keys"));
        assert!(c.contains("      tok-123\n"));
        assert!(c.contains("permissions: '0600'"));
        assert!(c.contains("runcmd:"));
    }
}
