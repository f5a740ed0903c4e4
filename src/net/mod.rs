/*! Networking for the darknode

Contents:
- `boot`: the bootstrap set and operator-supplied peer lists.
- `ip`: external IP resolution and the node's own peer address.
- `dial`: dialing the bootstrap set under the network policy.
*/

pub mod boot;
pub mod dial;
pub mod ip;
