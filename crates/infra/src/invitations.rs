//! Invitation mail for newly added administrators.

use vowline_accounts::{AccountRole, AdminAccount};
use vowline_notify::OutboundMessage;

pub const INVITATION_SUBJECT: &str = "You've been invited to manage the wedding";

fn role_label(role: AccountRole) -> &'static str {
    match role {
        AccountRole::Owner => "Owner",
        AccountRole::Admin => "Admin",
    }
}

/// Render the invitation for `account`, linking to the admin setup page
/// under `app_url`.
pub fn invitation_message(account: &AdminAccount, app_url: &str) -> OutboundMessage {
    let setup = format!("{}/auth/admin/setup", app_url.trim_end_matches('/'));
    let role = role_label(account.role);

    let html = format!(
        "<p>Hi,</p>\
         <p>You've been invited to help manage the wedding website.</p>\
         <p>Your role: <strong>{role}</strong></p>\
         <p><a href=\"{setup}\">Set up your account</a></p>\
         <p>This invitation expires in 7 days.</p>"
    );
    let text = format!(
        "Hi,\n\n\
         You've been invited to help manage the wedding website.\n\n\
         Your role: {role}\n\n\
         Set up your account: {setup}\n\n\
         This invitation expires in 7 days.\n"
    );

    OutboundMessage::new(account.email.clone(), INVITATION_SUBJECT, html, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vowline_accounts::{AccountGuard, InMemoryAccountStore, NewAdminAccount};

    #[tokio::test]
    async fn invitation_names_role_and_setup_link() {
        let guard = AccountGuard::new(InMemoryAccountStore::arc());
        let account = guard
            .invite(NewAdminAccount::new("Helper@Example.com", AccountRole::Admin))
            .await
            .unwrap();

        let message = invitation_message(&account, "https://wedding.example.com/");
        assert_eq!(message.to, "helper@example.com");
        assert_eq!(message.subject, INVITATION_SUBJECT);
        assert!(message.html.contains("Your role: <strong>Admin</strong>"));
        assert!(message.text.contains("https://wedding.example.com/auth/admin/setup"));
        assert!(message.text.contains("expires in 7 days"));
    }
}
