//! nginx virtual hosts and certbot issuance.

use crate::config::write_remote_file;
use crate::error::Result;
use crate::runner::{quote, CommandRunner};

const SITE_DIR: &str = "/etc/nginx/conf.d";

/// conf.d is read by both the Debian and RedHat nginx packages.
pub fn site_path(slug: &str) -> String {
    format!("{}/homeport-{}.conf", SITE_DIR, slug)
}

pub fn render_vhost(domain: &str, port: u16) -> String {
    format!(
        "server {{\n\
         \x20   listen 80;\n\
         \x20   listen [::]:80;\n\
         \x20   server_name {domain};\n\
         \n\
         \x20   client_max_body_size 100m;\n\
         \n\
         \x20   location / {{\n\
         \x20       proxy_pass http://127.0.0.1:{port};\n\
         \x20       proxy_http_version 1.1;\n\
         \x20       proxy_set_header Host $host;\n\
         \x20       proxy_set_header X-Real-IP $remote_addr;\n\
         \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
         \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
         \x20       proxy_set_header Upgrade $http_upgrade;\n\
         \x20       proxy_set_header Connection \"upgrade\";\n\
         \x20   }}\n\
         }}\n"
    )
}

pub async fn setup_site(runner: &dyn CommandRunner, slug: &str, domain: &str, port: u16) -> Result<()> {
    write_remote_file(runner, &site_path(slug), &render_vhost(domain, port), "644").await?;
    runner
        .execute_privileged("nginx -t")
        .await
        .check("validate nginx configuration")?;
    runner
        .execute_privileged("systemctl enable --now nginx && systemctl reload nginx")
        .await
        .check("reload nginx")?;
    Ok(())
}

/// Best-effort: drop the site and reload nginx.
pub async fn remove_site(runner: &dyn CommandRunner, slug: &str) {
    let output = runner
        .execute_privileged(&format!(
            "rm -f {} && (nginx -t && systemctl reload nginx || true)",
            quote(&site_path(slug))
        ))
        .await;
    if !output.success() {
        log::warn!("Failed to remove nginx site for {}: {}", slug, output.combined());
    }
}

pub fn certbot_command(domain: &str, email: Option<&str>) -> String {
    let account = match email {
        Some(email) if !email.trim().is_empty() => format!("-m {}", quote(email.trim())),
        _ => "--register-unsafely-without-email".to_string(),
    };
    format!(
        "certbot --nginx --non-interactive --agree-tos --redirect {} -d {}",
        account,
        quote(domain)
    )
}

pub async fn issue_certificate(runner: &dyn CommandRunner, domain: &str, email: Option<&str>) -> Result<()> {
    runner
        .execute_privileged(&certbot_command(domain, email))
        .await
        .check(&format!("issue certificate for {}", domain))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vhost_proxies_to_local_port() {
        let vhost = render_vhost("app.example.com", 8080);
        assert!(vhost.contains("    server_name app.example.com;\n"));
        assert!(vhost.contains("proxy_pass http://127.0.0.1:8080;"));
        assert!(vhost.starts_with("server {\n"));
        assert!(vhost.ends_with("}\n"));
    }

    #[test]
    fn certbot_uses_email_when_given() {
        assert_eq!(
            certbot_command("app.example.com", Some("ops@example.com")),
            "certbot --nginx --non-interactive --agree-tos --redirect -m ops@example.com -d app.example.com"
        );
        assert!(certbot_command("app.example.com", None).contains("--register-unsafely-without-email"));
    }
}
