// Demonstrates synchronously connecting, binding to,
// and disconnecting from the server.

use ldaplink::result::Result;
use ldaplink::LdapConn;

fn main() -> Result<()> {
    let mut ldap = LdapConn::new("ldap://localhost:2389")?;
    let _res = ldap
        .simple_bind("cn=Manager,dc=example,dc=org", "secret")?
        .success()?;
    Ok(ldap.unbind()?)
}
