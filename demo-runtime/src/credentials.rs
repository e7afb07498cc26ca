//! Per-lease login credentials and the cloud-init payload that installs them.

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "able", "amber", "brave", "bright", "calm", "clever", "cosmic", "crisp", "daring", "eager",
    "fair", "fancy", "gentle", "glad", "golden", "happy", "honest", "jolly", "keen", "kind",
    "lively", "lucky", "merry", "mighty", "noble", "polite", "proud", "quick", "quiet", "rapid",
    "sharp", "shiny", "smart", "solid", "steady", "sunny", "swift", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "bison", "cobra", "condor", "crane", "dingo", "eagle", "falcon", "ferret",
    "gecko", "heron", "ibex", "jackal", "koala", "lemur", "lynx", "marmot", "moose", "newt",
    "ocelot", "otter", "panda", "puffin", "quail", "raven", "salmon", "seal", "stork", "tapir",
    "toucan", "viper", "walrus", "weasel", "wombat", "yak", "zebra",
];

/// Login pair handed out with a networked lease.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn pick(words: &'static [&'static str]) -> &'static str {
    words.choose(&mut rand::thread_rng()).copied().unwrap_or("demo")
}

/// A lowercase word, valid as a unix login name.
pub fn generate_username() -> String {
    pick(ADJECTIVES).to_string()
}

/// `adjective-noun-NNNN`: readable over the phone, not guessable from the
/// username.
pub fn generate_password() -> String {
    let digits: u16 = rand::thread_rng().gen_range(1000..10000);
    format!("{}-{}-{digits}", pick(ADJECTIVES), pick(NOUNS))
}

/// Username and password drawn independently of each other.
pub fn generate_credentials() -> Credentials {
    Credentials {
        username: generate_username(),
        password: generate_password(),
    }
}

/// Cloud-init user data that creates the lease user with password SSH login.
pub fn cloud_init_user_data(credentials: &Credentials) -> String {
    let lines = [
        "#cloud-config".to_string(),
        "ssh_pwauth: True".to_string(),
        "manage_etc_hosts: True".to_string(),
        "users:".to_string(),
        format!(" - name: {}", credentials.username),
        "   groups: sudo".to_string(),
        format!("   plain_text_passwd: {}", credentials.password),
        "   lock_passwd: False".to_string(),
        "   shell: /bin/bash".to_string(),
    ];
    let mut data = lines.join("\n");
    data.push('\n');
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_is_login_safe() {
        for _ in 0..50 {
            let name = generate_username();
            assert!(!name.is_empty());
            assert!(name.chars().all(|ch| ch.is_ascii_lowercase()));
        }
    }

    #[test]
    fn password_shape() {
        let password = generate_password();
        let parts: Vec<&str> = password.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|ch| ch.is_ascii_digit()));
    }

    #[test]
    fn user_data_embeds_credentials() {
        let credentials = Credentials {
            username: "brave".into(),
            password: "quiet-otter-1234".into(),
        };
        let data = cloud_init_user_data(&credentials);
        assert!(data.starts_with("#cloud-config\n"));
        assert!(data.contains("ssh_pwauth: True"));
        assert!(data.contains(" - name: brave\n"));
        assert!(data.contains("   plain_text_passwd: quiet-otter-1234\n"));
    }
}
